//! Block sync engine.
//!
//! Crawls the chain in batches while behind the tip, then narrows to a
//! slow poll plus an optional WebSocket push channel once caught up. The
//! `block-crawl` checkpoint only ever advances to the highest height that
//! is contiguous with everything already stored, so a crash at any point
//! resumes without gaps.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::IndexerSettings;
use crate::cron::{CronScheduler, TickFn};
use crate::db::models::{
    Block, BlockSignature, Checkpoint, Event, EventAttribute, EventSource, JOB_BLOCK_CRAWL,
};
use crate::db::PostgresClient;
use crate::registry::AttributeCodec;
use crate::resilience::{classify_error, ErrorClass, ResilienceManager};
use crate::rpc::types::{AbciEvent, BlockResponse, BlockResultsResponse};
use crate::rpc::{spawn_new_block_subscription, PushEvent, RpcClient};

const PUSH_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// The tip moving backwards by a height or two is ordinary node jitter;
/// only a drop past this is worth shouting about.
const TIP_REGRESSION_TOLERANCE: u64 = 10;

/// Oversized bloom payloads are stored zeroed; nothing downstream reads them.
const SCRUBBED_EVENT: &str = "block_bloom";
const SCRUBBED_ATTRIBUTE: &str = "bloom";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTrigger {
    Poll,
    Push,
}

struct EngineState {
    current_height: u64,
    latest_known: u64,
    caught_up: bool,
    /// True once the crawler has reached the tip at least once since the
    /// last real backlog. Gates the push channel so a freshly restarted
    /// indexer finishes its batch crawl before subscribing.
    backlog_drained: bool,
    last_backup_poll: Option<Instant>,
}

struct PushState {
    subscribed: bool,
    ws_cancel: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
}

pub struct BlockSyncEngine {
    rpc: RpcClient,
    db: Arc<PostgresClient>,
    resilience: Arc<ResilienceManager>,
    codec: AttributeCodec,
    settings: IndexerSettings,
    push_enabled: bool,
    scheduler: CronScheduler,
    /// Held for the duration of a fetch cycle; overlapping ticks no-op.
    fetch_lock: tokio::sync::Mutex<()>,
    state: Mutex<EngineState>,
    push: Mutex<PushState>,
    push_tx: mpsc::Sender<PushEvent>,
    /// Cadence changes are applied by a dedicated task so a tick never
    /// awaits its own re-registration.
    interval_tx: mpsc::Sender<Duration>,
    shutdown: CancellationToken,
    job_id: Mutex<Option<Uuid>>,
    last_progress_log: Mutex<Instant>,
}

impl BlockSyncEngine {
    pub async fn new(
        rpc: RpcClient,
        db: Arc<PostgresClient>,
        resilience: Arc<ResilienceManager>,
        codec: AttributeCodec,
        settings: IndexerSettings,
        push_enabled: bool,
        scheduler: CronScheduler,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let current_height = match db.get_checkpoint(JOB_BLOCK_CRAWL).await? {
            Some(checkpoint) => checkpoint.height,
            None => {
                let start = settings.start_height.saturating_sub(1);
                db.set_checkpoint(&Checkpoint::new(JOB_BLOCK_CRAWL, start))
                    .await?;
                info!("No block checkpoint found, starting at height {}", start + 1);
                start
            }
        };

        let (push_tx, push_rx) = mpsc::channel(64);
        let (interval_tx, interval_rx) = mpsc::channel(8);

        let engine = Arc::new(Self {
            rpc,
            db,
            resilience,
            codec,
            settings,
            push_enabled,
            scheduler,
            fetch_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(EngineState {
                current_height,
                latest_known: 0,
                caught_up: false,
                backlog_drained: false,
                last_backup_poll: None,
            }),
            push: Mutex::new(PushState {
                subscribed: false,
                ws_cancel: None,
                reconnect: None,
            }),
            push_tx,
            interval_tx,
            shutdown,
            job_id: Mutex::new(None),
            last_progress_log: Mutex::new(Instant::now()),
        });

        engine.clone().spawn_push_listener(push_rx);
        engine.clone().spawn_interval_listener(interval_rx);

        Ok(engine)
    }

    /// Fetches the chain tip once and registers the poll job at the
    /// catch-up cadence. A failure here is fatal to startup.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let latest = self
            .rpc
            .latest_height()
            .await
            .context("fetching initial chain tip")?;

        {
            let state = &mut *self.state.lock().unwrap();
            state.latest_known = latest;
            info!(
                "Block sync starting at height {} with chain tip at {}",
                state.current_height + 1,
                latest
            );
        }

        self.reschedule(Duration::from_millis(self.settings.catch_up_interval_ms))
            .await
    }

    pub fn current_height(&self) -> u64 {
        self.state.lock().unwrap().current_height
    }

    async fn reschedule(self: &Arc<Self>, interval: Duration) -> anyhow::Result<()> {
        let engine = self.clone();
        let tick: TickFn = Box::new(move || {
            let engine = engine.clone();
            Box::pin(async move { engine.tick(TickTrigger::Poll).await })
        });

        let new_id = self.scheduler.add_repeated("block-sync", interval, tick).await?;
        let old_id = self.job_id.lock().unwrap().replace(new_id);
        if let Some(id) = old_id {
            self.scheduler.remove(&id).await?;
        }

        Ok(())
    }

    pub async fn tick(self: Arc<Self>, trigger: TickTrigger) {
        if !self.resilience.is_crawling() {
            return;
        }

        // With the push channel open the poll job only runs as a safety
        // net, at the backup cadence.
        if trigger == TickTrigger::Poll {
            let subscribed = self.push.lock().unwrap().subscribed;
            if subscribed {
                let mut state = self.state.lock().unwrap();
                let backup = Duration::from_millis(self.settings.backup_poll_interval_ms);
                match state.last_backup_poll {
                    Some(at) if at.elapsed() < backup => return,
                    _ => state.last_backup_poll = Some(Instant::now()),
                }
            }
        }

        let Ok(_guard) = self.fetch_lock.try_lock() else {
            return;
        };

        if let Err(err) = self.fetch_cycle().await {
            match classify_error(&err) {
                ErrorClass::Network => {
                    warn!("Node unreachable, skipping sync cycle: {:#}", err)
                }
                ErrorClass::Server => self.resilience.stop_crawling(&err, "block-sync"),
                ErrorClass::NonCritical => error!("Block sync cycle failed: {:#}", err),
            }
            return;
        }

        self.adjust_mode();
    }

    async fn fetch_cycle(&self) -> anyhow::Result<()> {
        let current = self.state.lock().unwrap().current_height;

        let latest = self.rpc.latest_height().await?;
        {
            let mut state = self.state.lock().unwrap();
            if tip_regressed(state.latest_known, latest) {
                warn!(
                    "Chain tip moved backwards from {} to {}",
                    state.latest_known, latest
                );
            }
            state.latest_known = latest;
            if latest.saturating_sub(state.current_height) > self.settings.blocks_per_call {
                state.backlog_drained = false;
            }
        }

        let Some((start, end)) = select_range(current, latest, self.settings.blocks_per_call)
        else {
            // At the tip; refresh the heartbeat so lag monitors stay quiet.
            self.db.touch_checkpoint(JOB_BLOCK_CRAWL).await?;
            self.state.lock().unwrap().backlog_drained = true;
            return Ok(());
        };

        let results = join_all((start..=end).map(|height| self.fetch_pair(height))).await;

        let mut fetched: Vec<(u64, BlockResponse, BlockResultsResponse)> = Vec::new();
        let mut dropped = 0usize;
        let mut last_failure: Option<anyhow::Error> = None;
        for (height, result) in (start..=end).zip(results) {
            match result {
                Ok((block, block_results)) => fetched.push((height, block, block_results)),
                Err(err) => {
                    dropped += 1;
                    warn!("Dropping height {} from this cycle: {:#}", height, err);
                    last_failure = Some(err);
                }
            }
        }

        if fetched.is_empty() {
            // Keep the underlying cause so a connection failure still reads
            // as a network error to the caller.
            let cause = last_failure.unwrap_or_else(|| anyhow!("empty fetch result"));
            return Err(cause.context(format!("all heights in {}..={} failed to fetch", start, end)));
        }

        let candidates: Vec<u64> = fetched.iter().map(|(height, ..)| *height).collect();
        let existing: HashSet<u64> = self
            .db
            .existing_heights(&candidates)
            .await?
            .into_iter()
            .collect();

        let mut persisted = existing.clone();
        let mut to_insert = Vec::with_capacity(fetched.len());
        for (height, block, block_results) in fetched {
            if existing.contains(&height) {
                debug!("Block {} already stored, skipping", height);
                continue;
            }
            to_insert.push(self.transform_block(height, block, block_results));
            persisted.insert(height);
        }

        let checkpoint = match highest_contiguous(start, &persisted) {
            Some(height) => height,
            None => {
                // The first height of the range failed. Anything fetched
                // above the gap is stored now and deduped on the retry; the
                // checkpoint stays put so the gap itself is refetched.
                warn!(
                    "Height {} missing, checkpoint stays at {} ({} heights dropped)",
                    start, current, dropped
                );
                current
            }
        };

        if !to_insert.is_empty() || checkpoint > current {
            self.db
                .insert_blocks(&to_insert, JOB_BLOCK_CRAWL, checkpoint)
                .await?;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.current_height = checkpoint;
            if state.current_height >= state.latest_known {
                state.backlog_drained = true;
            }
        }

        self.log_progress(checkpoint, latest);

        Ok(())
    }

    async fn fetch_pair(
        &self,
        height: u64,
    ) -> anyhow::Result<(BlockResponse, BlockResultsResponse)> {
        tokio::try_join!(self.rpc.block(height), self.rpc.block_results(height))
    }

    fn transform_block(
        &self,
        height: u64,
        block: BlockResponse,
        results: BlockResultsResponse,
    ) -> Block {
        let raw = if self.settings.keep_raw {
            serde_json::to_value(&block).ok()
        } else {
            None
        };

        let signatures = block
            .block
            .last_commit
            .as_ref()
            .map(|commit| {
                commit
                    .signatures
                    .iter()
                    .filter(|sig| !sig.validator_address.is_empty())
                    .map(|sig| BlockSignature {
                        validator_address: sig.validator_address.clone(),
                        timestamp: sig.timestamp,
                        signature: sig.signature.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut events = Vec::new();
        self.collect_events(
            &mut events,
            height,
            EventSource::BeginBlock,
            results.begin_block_events.as_deref().unwrap_or_default(),
        );
        self.collect_events(
            &mut events,
            height,
            EventSource::EndBlock,
            results.end_block_events.as_deref().unwrap_or_default(),
        );
        // CometBFT 0.38 folds both phases into a single finalize list.
        self.collect_events(
            &mut events,
            height,
            EventSource::EndBlock,
            results.finalize_block_events.as_deref().unwrap_or_default(),
        );

        Block {
            height,
            hash: block.block_id.hash,
            time: block.block.header.time,
            proposer_address: block.block.header.proposer_address,
            tx_count: block.block.data.txs.len() as i32,
            raw,
            signatures,
            events,
        }
    }

    fn collect_events(
        &self,
        out: &mut Vec<Event>,
        height: u64,
        source: EventSource,
        raw: &[AbciEvent],
    ) {
        for event in raw {
            out.push(self.transform_event(height, source, event));
        }
    }

    fn transform_event(&self, height: u64, source: EventSource, raw: &AbciEvent) -> Event {
        let attributes = raw
            .attributes
            .iter()
            .enumerate()
            .map(|(index, attr)| {
                let key = self.codec.decode_attribute(&attr.key);
                let value = if raw.kind == SCRUBBED_EVENT && key == SCRUBBED_ATTRIBUTE {
                    String::from("0x0")
                } else {
                    self.codec.decode_attribute(&attr.value)
                };
                EventAttribute {
                    key,
                    value,
                    index: index as i32,
                }
            })
            .collect();

        Event {
            height,
            tx_hash: None,
            msg_index: None,
            kind: raw.kind.clone(),
            source,
            attributes,
        }
    }

    fn log_progress(&self, checkpoint: u64, latest: u64) {
        let mut last = self.last_progress_log.lock().unwrap();
        if last.elapsed() >= PROGRESS_LOG_INTERVAL {
            info!(
                "Synced blocks to height {} ({} behind tip)",
                checkpoint,
                latest.saturating_sub(checkpoint)
            );
            *last = Instant::now();
        }
    }

    /// Re-evaluates catch-up mode after a successful cycle: adjusts the
    /// poll cadence on transitions and opens or closes the push channel.
    fn adjust_mode(self: &Arc<Self>) {
        let (caught_up, was_caught_up, drained) = {
            let mut state = self.state.lock().unwrap();
            let was = state.caught_up;
            state.caught_up = is_caught_up(
                state.current_height,
                state.latest_known,
                self.settings.caught_up_threshold,
            );
            (state.caught_up, was, state.backlog_drained)
        };

        if caught_up && !was_caught_up {
            info!("Caught up with chain tip, relaxing poll cadence");
            self.request_interval(Duration::from_millis(self.settings.caught_up_interval_ms));
        } else if !caught_up && was_caught_up {
            info!("Fell behind chain tip, restoring catch-up cadence");
            self.close_push();
            self.request_interval(Duration::from_millis(self.settings.catch_up_interval_ms));
        }

        if caught_up && drained && self.push_enabled {
            self.open_push();
        }
    }

    fn request_interval(&self, interval: Duration) {
        if self.interval_tx.try_send(interval).is_err() {
            error!("Poll cadence queue full, keeping current interval");
        }
    }

    fn spawn_interval_listener(self: Arc<Self>, mut rx: mpsc::Receiver<Duration>) {
        tokio::spawn(async move {
            loop {
                let interval = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    interval = rx.recv() => match interval {
                        Some(interval) => interval,
                        None => return,
                    },
                };
                if let Err(err) = self.reschedule(interval).await {
                    error!("Failed to adjust poll cadence: {:#}", err);
                }
            }
        });
    }

    fn open_push(self: &Arc<Self>) {
        let mut push = self.push.lock().unwrap();
        if push.subscribed {
            return;
        }
        if let Some(pending) = push.reconnect.take() {
            pending.cancel();
        }

        info!("Opening push channel for new block headers");
        let token = self.shutdown.child_token();
        spawn_new_block_subscription(
            self.rpc.websocket_url(),
            self.push_tx.clone(),
            token.clone(),
        );
        push.ws_cancel = Some(token);
        push.subscribed = true;
    }

    fn close_push(&self) {
        let mut push = self.push.lock().unwrap();
        if let Some(token) = push.ws_cancel.take() {
            token.cancel();
        }
        if let Some(token) = push.reconnect.take() {
            token.cancel();
        }
        push.subscribed = false;
    }

    fn spawn_push_listener(self: Arc<Self>, mut rx: mpsc::Receiver<PushEvent>) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                match event {
                    PushEvent::NewBlock(height) => {
                        let (current, caught_up) = {
                            let state = self.state.lock().unwrap();
                            (state.current_height, state.caught_up)
                        };
                        // A backlog means the poll loop is already on it.
                        if !caught_up || height <= current {
                            continue;
                        }
                        debug!("Push notification for block {}", height);
                        let engine = self.clone();
                        tokio::spawn(async move { engine.tick(TickTrigger::Push).await });
                    }
                    PushEvent::Disconnected => self.handle_push_disconnect(),
                }
            }
        });
    }

    /// At most one reconnect attempt is pending at a time; while it waits,
    /// the poll job is the only source of progress.
    fn handle_push_disconnect(self: &Arc<Self>) {
        let caught_up = self.state.lock().unwrap().caught_up;
        let mut push = self.push.lock().unwrap();
        push.subscribed = false;
        push.ws_cancel = None;

        if !self.push_enabled || !caught_up || push.reconnect.is_some() {
            return;
        }

        warn!(
            "Push channel dropped, retrying in {:?}; polling continues meanwhile",
            PUSH_RECONNECT_DELAY
        );
        let token = self.shutdown.child_token();
        push.reconnect = Some(token.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(PUSH_RECONNECT_DELAY) => {}
            }
            engine.push.lock().unwrap().reconnect = None;
            if engine.state.lock().unwrap().caught_up {
                engine.open_push();
            }
        });
    }
}

/// Next contiguous batch of heights to fetch, or `None` when at the tip.
fn select_range(current: u64, latest: u64, batch: u64) -> Option<(u64, u64)> {
    let start = current + 1;
    if start > latest {
        return None;
    }
    Some((start, (start + batch.max(1) - 1).min(latest)))
}

/// Highest height reachable from `start` through stored heights without a
/// gap. `None` when `start` itself is missing.
fn highest_contiguous(start: u64, stored: &HashSet<u64>) -> Option<u64> {
    if !stored.contains(&start) {
        return None;
    }
    let mut height = start;
    while stored.contains(&(height + 1)) {
        height += 1;
    }
    Some(height)
}

fn is_caught_up(current: u64, latest: u64, threshold: u64) -> bool {
    latest.saturating_sub(current) <= threshold
}

fn tip_regressed(previous: u64, latest: u64) -> bool {
    latest.saturating_add(TIP_REGRESSION_TOLERANCE) < previous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_clamped_to_tip() {
        assert_eq!(select_range(990, 1000, 5), Some((991, 995)));
        assert_eq!(select_range(998, 1000, 5), Some((999, 1000)));
        assert_eq!(select_range(1000, 1000, 5), None);
        assert_eq!(select_range(1001, 1000, 5), None);
    }

    #[test]
    fn checkpoint_advances_through_full_batch() {
        let stored: HashSet<u64> = (991..=995).collect();
        assert_eq!(highest_contiguous(991, &stored), Some(995));
    }

    #[test]
    fn checkpoint_stops_before_gap() {
        let stored: HashSet<u64> = [991, 992, 994, 995].into_iter().collect();
        assert_eq!(highest_contiguous(991, &stored), Some(992));
    }

    #[test]
    fn checkpoint_holds_when_first_height_missing() {
        let stored: HashSet<u64> = [992, 993].into_iter().collect();
        assert_eq!(highest_contiguous(991, &stored), None);
    }

    #[test]
    fn catch_up_threshold() {
        assert!(is_caught_up(997, 1000, 3));
        assert!(!is_caught_up(996, 1000, 3));
        assert!(is_caught_up(1000, 1000, 3));
        assert!(is_caught_up(1002, 1000, 3));
    }

    #[test]
    fn tip_jitter_is_tolerated() {
        assert!(!tip_regressed(1000, 999));
        assert!(!tip_regressed(1000, 1000 - TIP_REGRESSION_TOLERANCE));
        assert!(tip_regressed(1000, 1000 - TIP_REGRESSION_TOLERANCE - 1));
        assert!(!tip_regressed(0, 0));
    }

    #[test]
    fn exhausted_range_keeps_network_class() {
        let cause = anyhow!("error sending request: connection refused");
        let err = cause.context("all heights in 991..=995 failed to fetch");
        assert_eq!(classify_error(&err), ErrorClass::Network);
    }

    // Type-level check only; the poll job runs ticks on worker threads.
    #[test]
    fn tick_future_is_send() {
        fn assert_send<F: std::future::Future + Send>(_f: F) {}
        #[allow(dead_code)]
        fn check(engine: Arc<BlockSyncEngine>) {
            assert_send(engine.tick(TickTrigger::Poll));
        }
    }
}
