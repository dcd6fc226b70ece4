//! Transaction decode pipeline.
//!
//! Runs behind the block crawler off its own `tx-crawl` checkpoint. Each
//! cycle picks the next window of already-stored blocks, pages the node's
//! `tx_search` endpoint for every block that carried transactions, decodes
//! the signed bytes through the message registry, and attributes tx events
//! to the message that emitted them.
//!
//! Blocks are persisted as a prefix: a failure at height H stores
//! everything below H and leaves the checkpoint there, so H is retried
//! next cycle and nothing above it is claimed early.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use prost::Message as _;

use crate::config::IndexerSettings;
use crate::db::models::{
    Event, EventAttribute, EventSource, Checkpoint, Transaction, TransactionMessage,
    JOB_BLOCK_CRAWL, JOB_TX_CRAWL,
};
use crate::db::PostgresClient;
use crate::registry::proto::{AuthInfo, TxBody, TxRaw};
use crate::registry::{extract_sender, AttributeCodec, MessageRegistry};
use crate::resilience::{classify_error, ErrorClass, ResilienceManager};
use crate::rpc::types::{AbciEvent, TxLogEntry, TxSearchResult};
use crate::rpc::RpcClient;

/// Hard stop on `tx_search` paging; no sane block needs this many pages.
const MAX_TX_PAGES: u32 = 100;

pub struct TxPipeline {
    rpc: RpcClient,
    db: Arc<PostgresClient>,
    resilience: Arc<ResilienceManager>,
    registry: Arc<MessageRegistry>,
    codec: AttributeCodec,
    settings: IndexerSettings,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl TxPipeline {
    pub async fn new(
        rpc: RpcClient,
        db: Arc<PostgresClient>,
        resilience: Arc<ResilienceManager>,
        registry: Arc<MessageRegistry>,
        codec: AttributeCodec,
        settings: IndexerSettings,
    ) -> anyhow::Result<Arc<Self>> {
        if db.get_checkpoint(JOB_TX_CRAWL).await?.is_none() {
            let start = settings.start_height.saturating_sub(1);
            db.set_checkpoint(&Checkpoint::new(JOB_TX_CRAWL, start)).await?;
            info!("No transaction checkpoint found, starting at height {}", start + 1);
        }

        Ok(Arc::new(Self {
            rpc,
            db,
            resilience,
            registry,
            codec,
            settings,
            fetch_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub async fn tick(self: Arc<Self>) {
        if !self.resilience.is_crawling() {
            return;
        }

        let Ok(_guard) = self.fetch_lock.try_lock() else {
            return;
        };

        if let Err(err) = self.crawl_cycle().await {
            match classify_error(&err) {
                ErrorClass::Network => {
                    warn!("Node unreachable, skipping tx cycle: {:#}", err)
                }
                ErrorClass::Server => self.resilience.stop_crawling(&err, "tx-crawl"),
                ErrorClass::NonCritical => error!("Transaction cycle failed: {:#}", err),
            }
        }
    }

    async fn crawl_cycle(&self) -> anyhow::Result<()> {
        let tx_height = self
            .db
            .get_checkpoint(JOB_TX_CRAWL)
            .await?
            .map(|c| c.height)
            .ok_or_else(|| anyhow!("tx-crawl checkpoint disappeared"))?;
        let block_height = self
            .db
            .get_checkpoint(JOB_BLOCK_CRAWL)
            .await?
            .map(|c| c.height)
            .unwrap_or(tx_height);

        if tx_height >= block_height {
            // Fully drained; refresh the heartbeat.
            self.db.touch_checkpoint(JOB_TX_CRAWL).await?;
            return Ok(());
        }

        // Only heights the block crawler already persisted are eligible.
        let window_end = block_height.min(tx_height + self.settings.blocks_per_call);
        let candidates = self.db.blocks_with_txs(tx_height, window_end).await?;

        if candidates.is_empty() {
            // Empty blocks only; the whole window is complete.
            self.db
                .insert_transactions(&[], JOB_TX_CRAWL, window_end)
                .await?;
            return Ok(());
        }

        let fetched = join_all(
            candidates
                .iter()
                .map(|&(height, tx_count, time)| self.fetch_block_txs(height, tx_count, time)),
        )
        .await;

        // Prefix persistence: walk heights ascending and stop at the first
        // failure. Empty heights between candidates are complete by
        // construction, so the checkpoint jumps over them.
        let mut transactions = Vec::new();
        let mut checkpoint = tx_height;
        let mut stalled: Option<anyhow::Error> = None;
        for (&(height, ..), result) in candidates.iter().zip(fetched) {
            match result {
                Ok(txs) => {
                    transactions.extend(txs);
                    checkpoint = height;
                }
                Err(err) => {
                    stalled = Some(err.context(format!("crawling transactions at height {}", height)));
                    break;
                }
            }
        }
        if stalled.is_none() {
            checkpoint = window_end;
        }

        if !transactions.is_empty() || checkpoint > tx_height {
            let hashes: Vec<String> = transactions.iter().map(|t| t.hash.clone()).collect();
            let existing: BTreeSet<String> = self
                .db
                .existing_tx_hashes(&hashes)
                .await?
                .into_iter()
                .collect();
            if !existing.is_empty() {
                debug!("Skipping {} already-stored transactions", existing.len());
                transactions.retain(|t| !existing.contains(&t.hash));
            }

            self.db
                .insert_transactions(&transactions, JOB_TX_CRAWL, checkpoint)
                .await?;

            info!(
                "Stored {} transactions, tx checkpoint at {} ({} behind blocks)",
                transactions.len(),
                checkpoint,
                block_height.saturating_sub(checkpoint)
            );
        }

        match stalled {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pages `tx_search` until every transaction the block header promised
    /// has been seen. A count disagreement between the block and the index
    /// is a hard error; the checkpoint must not move past it.
    async fn fetch_block_txs(
        &self,
        height: u64,
        expected: i32,
        block_time: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Transaction>> {
        let per_page = self.settings.tx_per_page;

        // First page reveals the total; remaining pages go out together.
        let first = self.rpc.tx_search(height, 1, per_page).await?;
        let total = first.total_count;
        let pages = total.div_ceil(per_page.max(1) as u64) as u32;
        if pages > MAX_TX_PAGES {
            bail!(
                "tx_search reports {} transactions at height {}, past the paging limit",
                total,
                height
            );
        }

        let mut results: Vec<TxSearchResult> = first.txs;
        if pages > 1 {
            let rest = join_all((2..=pages).map(|page| self.rpc.tx_search(height, page, per_page)))
                .await;
            for response in rest {
                results.extend(response?.txs);
            }
        }

        if results.len() != expected as usize {
            bail!(
                "transaction count mismatch at height {}: block carries {}, tx_search returned {}",
                height,
                expected,
                results.len()
            );
        }

        results
            .into_iter()
            .map(|result| self.transform_tx(result, block_time))
            .collect()
    }

    fn transform_tx(
        &self,
        result: TxSearchResult,
        block_time: DateTime<Utc>,
    ) -> anyhow::Result<Transaction> {
        let raw_bytes = BASE64
            .decode(&result.tx)
            .with_context(|| format!("decoding tx bytes for {}", result.hash))?;

        let tx_raw = TxRaw::decode(raw_bytes.as_slice())
            .with_context(|| format!("decoding TxRaw for {}", result.hash))?;
        let body = TxBody::decode(tx_raw.body_bytes.as_slice())
            .with_context(|| format!("decoding TxBody for {}", result.hash))?;
        let auth_info = AuthInfo::decode(tx_raw.auth_info_bytes.as_slice())
            .with_context(|| format!("decoding AuthInfo for {}", result.hash))?;

        let fee = auth_info
            .fee
            .as_ref()
            .and_then(|fee| serde_json::to_value(fee).ok());

        let messages = body
            .messages
            .iter()
            .enumerate()
            .map(|(index, any)| {
                let content = self.registry.decode(&any.type_url, &any.value);
                TransactionMessage {
                    tx_hash: result.hash.clone(),
                    height: result.height,
                    index: index as i32,
                    kind: any.type_url.clone(),
                    sender: extract_sender(&content),
                    content,
                }
            })
            .collect();

        let mut events: Vec<Event> = result
            .tx_result
            .events
            .iter()
            .map(|raw| self.transform_event(&result, raw))
            .collect();

        if result.tx_result.code == 0 {
            correlate_events(&mut events, &result.tx_result.log, &result.hash);
        }

        Ok(Transaction {
            hash: result.hash,
            height: result.height,
            index: result.index,
            code: result.tx_result.code,
            gas_used: result.tx_result.gas_used,
            gas_wanted: result.tx_result.gas_wanted,
            fee,
            memo: body.memo,
            timestamp: block_time,
            raw: self.settings.keep_raw.then_some(raw_bytes),
            messages,
            events,
        })
    }

    fn transform_event(&self, result: &TxSearchResult, raw: &AbciEvent) -> Event {
        let attributes = raw
            .attributes
            .iter()
            .enumerate()
            .map(|(index, attr)| EventAttribute {
                key: self.codec.decode_attribute(&attr.key),
                value: self.codec.decode_attribute(&attr.value),
                index: index as i32,
            })
            .collect();

        Event {
            height: result.height,
            tx_hash: Some(result.hash.clone()),
            msg_index: None,
            kind: raw.kind.clone(),
            source: EventSource::Tx,
            attributes,
        }
    }
}

/// Stamps `msg_index` on the events that a specific message produced.
///
/// SDK 0.46+ chains label each event with a `msg_index` attribute; when
/// present that wins. Older chains need the stringified `log` field: its
/// structured form lists events per message, and the flat event stream is
/// the tx-wide prelude (fee deduction, the `tx` signature events) followed
/// by each message's events in order. A mismatch against the log is logged
/// as a diagnostic but the attribution stands; it is a best-effort hint,
/// not a correctness guarantee.
fn correlate_events(events: &mut [Event], log: &str, tx_hash: &str) {
    if stamp_from_attributes(events) {
        return;
    }

    let entries: Vec<TxLogEntry> = match serde_json::from_str(log) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    if entries.is_empty() {
        return;
    }

    let prelude = prelude_len(events);
    let mut cursor = prelude;
    for entry in &entries {
        for _ in &entry.events {
            if cursor >= events.len() {
                break;
            }
            events[cursor].msg_index = Some(entry.msg_index as i32);
            cursor += 1;
        }
    }

    if !attribution_matches(&events[prelude..], &entries) {
        warn!(
            "Event attribution self-check failed for tx {}, indexes may be off",
            tx_hash
        );
    }
}

/// Events before the first message's output: everything up to and
/// including the last `tx`-typed signature event.
fn prelude_len(events: &[Event]) -> usize {
    events
        .iter()
        .rposition(|event| event.kind == "tx")
        .map(|pos| pos + 1)
        .unwrap_or(0)
}

fn stamp_from_attributes(events: &mut [Event]) -> bool {
    let mut stamped = false;
    for event in events.iter_mut() {
        let index = event
            .attributes
            .iter()
            .find(|attr| attr.key == "msg_index")
            .and_then(|attr| attr.value.parse::<i32>().ok());
        if let Some(index) = index {
            event.msg_index = Some(index);
            stamped = true;
        }
    }
    stamped
}

/// Order-insensitive comparison of attributed events against the log.
fn attribution_matches(attributed: &[Event], entries: &[TxLogEntry]) -> bool {
    let from_events: BTreeSet<(i32, &str, &str, &str)> = attributed
        .iter()
        .filter_map(|event| {
            event.msg_index.map(|index| {
                event
                    .attributes
                    .iter()
                    .map(move |attr| (index, event.kind.as_str(), attr.key.as_str(), attr.value.as_str()))
            })
        })
        .flatten()
        .collect();

    let from_log: BTreeSet<(i32, &str, &str, &str)> = entries
        .iter()
        .flat_map(|entry| {
            entry.events.iter().flat_map(move |event| {
                event.attributes.iter().map(move |attr| {
                    (
                        entry.msg_index as i32,
                        event.kind.as_str(),
                        attr.key.as_str(),
                        attr.value.as_str(),
                    )
                })
            })
        })
        .collect();

    from_events == from_log
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &str, attrs: &[(&str, &str)]) -> Event {
        Event {
            height: 100,
            tx_hash: Some("AB12".into()),
            msg_index: None,
            kind: kind.into(),
            source: EventSource::Tx,
            attributes: attrs
                .iter()
                .enumerate()
                .map(|(i, (k, v))| EventAttribute {
                    key: (*k).into(),
                    value: (*v).into(),
                    index: i as i32,
                })
                .collect(),
        }
    }

    #[test]
    fn prelude_ends_at_last_tx_event() {
        let events = vec![
            event("coin_spent", &[("spender", "a")]),
            event("tx", &[("fee", "10stake")]),
            event("tx", &[("acc_seq", "a/1")]),
            event("message", &[("action", "/cosmos.bank.v1beta1.MsgSend")]),
        ];
        assert_eq!(prelude_len(&events), 3);
    }

    #[test]
    fn log_attribution_assigns_per_message_indexes() {
        let mut events = vec![
            event("tx", &[("fee", "10stake")]),
            event("message", &[("action", "send")]),
            event("transfer", &[("amount", "5stake")]),
            event("message", &[("action", "vote")]),
        ];
        let log = r#"[
            {"msg_index": 0, "events": [
                {"type": "message", "attributes": [{"key": "action", "value": "send"}]},
                {"type": "transfer", "attributes": [{"key": "amount", "value": "5stake"}]}
            ]},
            {"msg_index": 1, "events": [
                {"type": "message", "attributes": [{"key": "action", "value": "vote"}]}
            ]}
        ]"#;

        correlate_events(&mut events, log, "AB12");

        assert_eq!(events[0].msg_index, None);
        assert_eq!(events[1].msg_index, Some(0));
        assert_eq!(events[2].msg_index, Some(0));
        assert_eq!(events[3].msg_index, Some(1));
    }

    #[test]
    fn mismatched_log_keeps_attribution() {
        // Node-side filtering can leave the flat stream and the log out of
        // sync; the positional indexes still hold.
        let mut events = vec![
            event("tx", &[("fee", "10stake")]),
            event("transfer", &[("amount", "5stake")]),
        ];
        let log = r#"[
            {"msg_index": 0, "events": [
                {"type": "transfer", "attributes": [{"key": "amount", "value": "999stake"}]}
            ]}
        ]"#;

        correlate_events(&mut events, log, "AB12");

        assert_eq!(events[0].msg_index, None);
        assert_eq!(events[1].msg_index, Some(0));
    }

    #[test]
    fn msg_index_attribute_wins_over_log() {
        let mut events = vec![
            event("transfer", &[("amount", "5stake"), ("msg_index", "2")]),
            event("message", &[("action", "send")]),
        ];

        correlate_events(&mut events, "not json", "AB12");

        assert_eq!(events[0].msg_index, Some(2));
        assert_eq!(events[1].msg_index, None);
    }

    #[test]
    fn unparseable_log_leaves_events_unattributed() {
        let mut events = vec![event("transfer", &[("amount", "5stake")])];
        correlate_events(&mut events, "", "AB12");
        assert!(events.iter().all(|e| e.msg_index.is_none()));
    }
}
