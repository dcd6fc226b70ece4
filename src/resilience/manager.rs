//! Process-wide circuit breaker.
//!
//! One place for the rest of the system to ask "should I be doing work
//! right now?" and one place to report "something is badly wrong".
//! Constructed once at startup and passed by `Arc` to every component that
//! needs it; never a global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::resilience::classify::{classify_error, ErrorClass};
use crate::rpc::RpcClient;

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
    pub source: String,
}

/// Complete status snapshot. Transitions always set a consistent snapshot;
/// the struct is never partially updated.
#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub is_running: bool,
    pub is_crawling: bool,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stopped_reason: Option<String>,
    pub last_error: Option<LastError>,
}

impl IndexerStatus {
    fn healthy() -> Self {
        Self {
            is_running: true,
            is_crawling: true,
            stopped_at: None,
            stopped_reason: None,
            last_error: None,
        }
    }
}

/// Pushed to subscribers on every transition; consumed by the out-of-scope
/// broadcast component.
#[derive(Debug, Clone)]
pub enum StatusChange {
    Stopped { reason: String },
    CrawlingPaused { reason: String },
    Resumed,
}

pub struct ResilienceManager {
    status: Mutex<IndexerStatus>,
    // Mirrors of the two flags for lock-free hot-path checks.
    running: AtomicBool,
    crawling: AtomicBool,
    notify: broadcast::Sender<StatusChange>,
    rpc: RpcClient,
    recovery_interval: Duration,
    recovery: Mutex<Option<CancellationToken>>,
}

impl ResilienceManager {
    pub fn new(rpc: RpcClient, recovery_interval: Duration) -> Arc<Self> {
        let (notify, _) = broadcast::channel(64);
        Arc::new(Self {
            status: Mutex::new(IndexerStatus::healthy()),
            running: AtomicBool::new(true),
            crawling: AtomicBool::new(true),
            notify,
            rpc,
            recovery_interval,
            recovery: Mutex::new(None),
        })
    }

    /// Cheap check consulted before/within hot paths.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Cheap check: is ingestion active?
    pub fn is_crawling(&self) -> bool {
        self.crawling.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> IndexerStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.notify.subscribe()
    }

    /// Full stop: ingestion and APIs both unavailable. Idempotent while
    /// stopped; the first stop's timestamp and reason are retained.
    pub fn stop_indexer(self: &Arc<Self>, err: &anyhow::Error, source: &str) {
        let class = classify_error(err);
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            if !status.is_running {
                return;
            }
            error!("Stopping indexer ({}): {:#}", source, err);
            *status = IndexerStatus {
                is_running: false,
                is_crawling: false,
                stopped_at: Some(Utc::now()),
                stopped_reason: Some(format!("{:#}", err)),
                last_error: Some(LastError {
                    message: format!("{:#}", err),
                    at: Utc::now(),
                    source: source.to_string(),
                }),
            };
            self.running.store(false, Ordering::Relaxed);
            self.crawling.store(false, Ordering::Relaxed);
        }

        let _ = self.notify.send(StatusChange::Stopped {
            reason: format!("{:#}", err),
        });

        if class.escalates() {
            self.spawn_recovery(class);
        }
    }

    /// Pause ingestion only; read APIs stay available. Idempotent while
    /// paused.
    pub fn stop_crawling(self: &Arc<Self>, err: &anyhow::Error, source: &str) {
        let class = classify_error(err);
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            if !status.is_crawling {
                return;
            }
            error!("Pausing ingestion ({}): {:#}", source, err);
            status.is_crawling = false;
            status.stopped_at = Some(Utc::now());
            status.stopped_reason = Some(format!("{:#}", err));
            status.last_error = Some(LastError {
                message: format!("{:#}", err),
                at: Utc::now(),
                source: source.to_string(),
            });
            self.crawling.store(false, Ordering::Relaxed);
        }

        let _ = self.notify.send(StatusChange::CrawlingPaused {
            reason: format!("{:#}", err),
        });

        if class.escalates() {
            self.spawn_recovery(class);
        }
    }

    /// Clear all stop/pause state and cancel any recovery probing. Safe to
    /// call whether the stop was automatic or operator-driven.
    pub fn resume_indexer(&self) {
        {
            let mut recovery = self.recovery.lock().expect("recovery lock poisoned");
            if let Some(token) = recovery.take() {
                token.cancel();
            }
        }
        {
            let mut status = self.status.lock().expect("status lock poisoned");
            *status = IndexerStatus::healthy();
            self.running.store(true, Ordering::Relaxed);
            self.crawling.store(true, Ordering::Relaxed);
        }
        info!("Indexer resumed");
        let _ = self.notify.send(StatusChange::Resumed);
    }

    /// Whether a recovery probe loop is currently active.
    pub fn recovery_active(&self) -> bool {
        self.recovery
            .lock()
            .expect("recovery lock poisoned")
            .is_some()
    }

    /// Start the recurring health probe. Only node-failure classes get
    /// here; a second escalation while probing is a no-op.
    fn spawn_recovery(self: &Arc<Self>, class: ErrorClass) {
        let mut recovery = self.recovery.lock().expect("recovery lock poisoned");
        if recovery.is_some() {
            return;
        }

        info!(
            "Starting node recovery probe every {:?} (cause: {:?})",
            self.recovery_interval, class
        );
        let token = CancellationToken::new();
        *recovery = Some(token.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(manager.recovery_interval) => {}
                }

                match manager.rpc.health_probe().await {
                    Ok(()) => {
                        info!("Node is reachable again, resuming indexer");
                        // resume_indexer cancels our token; the next select
                        // iteration exits.
                        manager.resume_indexer();
                        return;
                    },
                    Err(e) => {
                        warn!("Node still unreachable: {:#}", e);
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeSettings;

    fn manager() -> Arc<ResilienceManager> {
        let settings = NodeSettings {
            rpc_url: "http://localhost:26657".to_string(),
            push_enabled: false,
            rpc_timeout_ms: 100,
            rpc_max_retries: 0,
        };
        let rpc = RpcClient::new(&settings).unwrap();
        ResilienceManager::new(rpc, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn starts_running_and_crawling() {
        let m = manager();
        assert!(m.is_running());
        assert!(m.is_crawling());
        let status = m.status();
        assert!(status.stopped_at.is_none());
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_retains_first_reason() {
        let m = manager();
        m.stop_indexer(&anyhow::anyhow!("connection refused"), "sync");
        let first = m.status();

        m.stop_indexer(&anyhow::anyhow!("some different error"), "other");
        let second = m.status();

        assert!(!second.is_running);
        assert_eq!(second.stopped_reason, first.stopped_reason);
        assert_eq!(second.stopped_at, first.stopped_at);
        assert_eq!(second.last_error.unwrap().source, "sync");
    }

    #[tokio::test]
    async fn resume_clears_state_and_recovery() {
        let m = manager();
        m.stop_indexer(&anyhow::anyhow!("connection refused"), "sync");
        assert!(m.recovery_active());

        m.resume_indexer();
        assert!(m.is_running());
        assert!(m.is_crawling());
        assert!(!m.recovery_active());
        assert!(m.status().stopped_reason.is_none());
    }

    #[tokio::test]
    async fn non_critical_stop_does_not_probe() {
        let m = manager();
        m.stop_crawling(&anyhow::anyhow!("tx count mismatch"), "txs");
        assert!(!m.is_crawling());
        assert!(m.is_running());
        assert!(!m.recovery_active());
    }

    #[tokio::test]
    async fn crawling_pause_keeps_reads_running() {
        let m = manager();
        m.stop_crawling(&anyhow::anyhow!("connection reset"), "sync");
        assert!(m.is_running());
        assert!(!m.is_crawling());
        assert!(m.recovery_active());
    }

    #[tokio::test]
    async fn transitions_notify_subscribers() {
        let m = manager();
        let mut rx = m.subscribe();
        m.stop_indexer(&anyhow::anyhow!("boom"), "sync");
        match rx.recv().await.unwrap() {
            StatusChange::Stopped { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected change: {:?}", other),
        }
    }
}
