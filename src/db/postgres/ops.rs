use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction as PgTransaction;
use log::error;

use crate::db::models::{Block, Checkpoint, Event, Transaction, TransactionMessage};
use crate::db::postgres::PostgresClient;

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns. Event attribute values coming
/// off the wire occasionally carry them.
fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

async fn upsert_checkpoint_in(
    tx: &PgTransaction<'_>,
    job_name: &str,
    height: u64,
) -> anyhow::Result<()> {
    let query = r#"
        INSERT INTO indexer.block_checkpoints (job_name, height, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (job_name) DO UPDATE SET
            height = EXCLUDED.height,
            updated_at = EXCLUDED.updated_at
    "#;
    tx.execute(query, &[&job_name, &(height as i64)]).await?;
    Ok(())
}

/// Insert one event and its attributes, returning nothing. Attributes are
/// written as one multi-row statement per event.
async fn insert_event_in(tx: &PgTransaction<'_>, event: &Event) -> anyhow::Result<()> {
    let row = tx
        .query_one(
            r#"
            INSERT INTO indexer.events (height, tx_hash, msg_index, type, source)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
            &[
                &(event.height as i64),
                &event.tx_hash,
                &event.msg_index,
                &event.kind,
                &event.source.as_str(),
            ],
        )
        .await?;
    let event_id: i64 = row.get(0);

    if event.attributes.is_empty() {
        return Ok(());
    }

    const COLS_PER_ROW: usize = 5;
    let values_clauses: Vec<String> = (0..event.attributes.len())
        .map(|i| {
            let start = i * COLS_PER_ROW + 1;
            let placeholders: Vec<String> =
                (start..start + COLS_PER_ROW).map(|n| format!("${}", n)).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let query = format!(
        r#"
        INSERT INTO indexer.event_attributes (event_id, index, key, value, composite_key)
        VALUES {}
        ON CONFLICT (event_id, index) DO NOTHING
        "#,
        values_clauses.join(", ")
    );

    let sanitized: Vec<(String, String, String)> = event
        .attributes
        .iter()
        .map(|a| {
            (
                sanitize_string(&a.key),
                sanitize_string(&a.value),
                sanitize_string(&a.composite_key(&event.kind)),
            )
        })
        .collect();

    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        Vec::with_capacity(event.attributes.len() * COLS_PER_ROW);
    for (i, attr) in event.attributes.iter().enumerate() {
        params.push(&event_id);
        params.push(&attr.index);
        params.push(&sanitized[i].0);
        params.push(&sanitized[i].1);
        params.push(&sanitized[i].2);
    }

    tx.execute(&query, &params).await?;
    Ok(())
}

impl PostgresClient {
    // ==================== CHECKPOINTS ====================

    /// Get the checkpoint for a pipeline stage, if it exists yet.
    pub async fn get_checkpoint(&self, job_name: &str) -> anyhow::Result<Option<Checkpoint>> {
        let client = self.pool.get().await?;
        let query =
            "SELECT job_name, height, updated_at FROM indexer.block_checkpoints WHERE job_name = $1";
        let row = client.query_opt(query, &[&job_name]).await?;

        Ok(row.map(|r| {
            let height: i64 = r.get("height");
            Checkpoint {
                job_name: r.get("job_name"),
                height: height as u64,
                updated_at: r.get("updated_at"),
            }
        }))
    }

    /// Upsert a checkpoint outside of any data write. Used only for lazy
    /// creation at the configured start height; normal advancement happens
    /// inside the same transaction as the rows it protects.
    pub async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO indexer.block_checkpoints (job_name, height, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_name) DO UPDATE SET
                height = EXCLUDED.height,
                updated_at = EXCLUDED.updated_at
        "#;
        client
            .execute(
                query,
                &[
                    &checkpoint.job_name,
                    &(checkpoint.height as i64),
                    &checkpoint.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to upsert checkpoint for {}: {:?}",
                    checkpoint.job_name, e
                );
                e
            })?;
        Ok(())
    }

    /// Refresh `updated_at` without moving the height. Keeps lag monitors
    /// quiet during no-op cycles at the chain tip.
    pub async fn touch_checkpoint(&self, job_name: &str) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE indexer.block_checkpoints SET updated_at = NOW() WHERE job_name = $1",
                &[&job_name],
            )
            .await?;
        Ok(())
    }

    // ==================== BLOCKS ====================

    /// Which of the candidate heights already have a block row. One batched
    /// query; the caller drops these before insertion so overlapping retries
    /// never duplicate a height.
    pub async fn existing_heights(&self, heights: &[u64]) -> anyhow::Result<Vec<u64>> {
        if heights.is_empty() {
            return Ok(vec![]);
        }

        let client = self.pool.get().await?;
        let candidates: Vec<i64> = heights.iter().map(|h| *h as i64).collect();
        let rows = client
            .query(
                "SELECT height FROM indexer.blocks WHERE height = ANY($1)",
                &[&candidates],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let h: i64 = r.get("height");
                h as u64
            })
            .collect())
    }

    /// Persist a batch of blocks with their signatures and begin/end-block
    /// events, and advance the block-crawl checkpoint, all in one
    /// transaction. Either everything commits or nothing does.
    pub async fn insert_blocks(
        &self,
        blocks: &[Block],
        checkpoint_job: &str,
        checkpoint_height: u64,
    ) -> anyhow::Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        for block in blocks {
            tx.execute(
                r#"
                INSERT INTO indexer.blocks (height, hash, time, proposer_address, tx_count, raw)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (height) DO NOTHING
                "#,
                &[
                    &(block.height as i64),
                    &block.hash,
                    &block.time,
                    &block.proposer_address,
                    &block.tx_count,
                    &block.raw,
                ],
            )
            .await?;

            for sig in &block.signatures {
                tx.execute(
                    r#"
                    INSERT INTO indexer.block_signatures (height, validator_address, timestamp, signature)
                    VALUES ($1, $2, $3, $4)
                    "#,
                    &[
                        &(block.height as i64),
                        &sig.validator_address,
                        &sig.timestamp,
                        &sig.signature,
                    ],
                )
                .await?;
            }

            for event in &block.events {
                insert_event_in(&tx, event).await?;
            }
        }

        upsert_checkpoint_in(&tx, checkpoint_job, checkpoint_height).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Blocks in `(from, to]` that carry at least one transaction.
    /// Returns `(height, tx_count, time)` in ascending height order.
    pub async fn blocks_with_txs(
        &self,
        from: u64,
        to: u64,
    ) -> anyhow::Result<Vec<(u64, i32, DateTime<Utc>)>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT height, tx_count, time FROM indexer.blocks
                WHERE height > $1 AND height <= $2 AND tx_count > 0
                ORDER BY height ASC
                "#,
                &[&(from as i64), &(to as i64)],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let h: i64 = r.get("height");
                (h as u64, r.get("tx_count"), r.get("time"))
            })
            .collect())
    }

    // ==================== TRANSACTIONS ====================

    /// Which of the candidate hashes are already stored.
    pub async fn existing_tx_hashes(&self, hashes: &[String]) -> anyhow::Result<Vec<String>> {
        if hashes.is_empty() {
            return Ok(vec![]);
        }

        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT hash FROM indexer.transactions WHERE hash = ANY($1)",
                &[&hashes],
            )
            .await?;

        Ok(rows.iter().map(|r| r.get("hash")).collect())
    }

    /// Persist a batch of decoded transactions with their messages and
    /// attributed events, and advance the tx-crawl checkpoint, in one
    /// transaction.
    pub async fn insert_transactions(
        &self,
        transactions: &[Transaction],
        checkpoint_job: &str,
        checkpoint_height: u64,
    ) -> anyhow::Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        for t in transactions {
            tx.execute(
                r#"
                INSERT INTO indexer.transactions
                    (hash, height, index, code, gas_used, gas_wanted, fee, memo, timestamp, raw)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (hash) DO NOTHING
                "#,
                &[
                    &t.hash,
                    &(t.height as i64),
                    &t.index,
                    &t.code,
                    &t.gas_used,
                    &t.gas_wanted,
                    &t.fee,
                    &sanitize_string(&t.memo),
                    &t.timestamp,
                    &t.raw,
                ],
            )
            .await?;

            for msg in &t.messages {
                tx.execute(
                    r#"
                    INSERT INTO indexer.transaction_messages
                        (tx_hash, height, index, type, sender, content)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (tx_hash, index) DO NOTHING
                    "#,
                    &[
                        &msg.tx_hash,
                        &(msg.height as i64),
                        &msg.index,
                        &msg.kind,
                        &msg.sender,
                        &msg.content,
                    ],
                )
                .await?;
            }

            for event in &t.events {
                insert_event_in(&tx, event).await?;
            }
        }

        upsert_checkpoint_in(&tx, checkpoint_job, checkpoint_height).await?;
        tx.commit().await?;
        Ok(())
    }

    // ==================== MESSAGE HANDOFF ====================

    /// Decoded messages in `(from, to]` ordered by `(height, index)`.
    ///
    /// This is the pull interface downstream processors consume: each
    /// processor reads from its own checkpoint up to the tx-crawl
    /// checkpoint, so replay after a restart is just re-running the query.
    pub async fn get_transaction_messages(
        &self,
        from: u64,
        to: u64,
    ) -> anyhow::Result<Vec<TransactionMessage>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT tx_hash, height, index, type, sender, content
                FROM indexer.transaction_messages
                WHERE height > $1 AND height <= $2
                ORDER BY height ASC, index ASC
                "#,
                &[&(from as i64), &(to as i64)],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let height: i64 = r.get("height");
                TransactionMessage {
                    tx_hash: r.get("tx_hash"),
                    height: height as u64,
                    index: r.get("index"),
                    kind: r.get("type"),
                    sender: r.get("sender"),
                    content: r.get("content"),
                }
            })
            .collect())
    }
}
