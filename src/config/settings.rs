use config::{Config, ConfigError, File};
use serde::Deserialize;

/// PostgreSQL database connection configuration.
///
/// Used for storing blocks, transactions, decoded messages, events
/// and per-stage sync checkpoints.
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    16
}

/// Upstream node (CometBFT RPC) configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    /// Base HTTP RPC endpoint, e.g. "http://localhost:26657".
    pub rpc_url: String,
    /// Enable the WebSocket push subscription for new-block events.
    /// Polling stays active either way as the backup path.
    #[serde(default = "default_push_enabled")]
    pub push_enabled: bool,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,
}

fn default_push_enabled() -> bool {
    true
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_rpc_max_retries() -> u32 {
    3
}

/// Ingestion pipeline tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexerSettings {
    /// Height to start crawling from when no checkpoint exists yet.
    #[serde(default)]
    pub start_height: u64,
    /// Maximum number of heights fetched per cycle.
    #[serde(default = "default_blocks_per_call")]
    pub blocks_per_call: u64,
    /// `latest - current` gap below which the indexer counts as caught up.
    #[serde(default = "default_caught_up_threshold")]
    pub caught_up_threshold: u64,
    /// Poll cadence while catching up, in milliseconds.
    #[serde(default = "default_catch_up_interval_ms")]
    pub catch_up_interval_ms: u64,
    /// Poll cadence once caught up, in milliseconds.
    #[serde(default = "default_caught_up_interval_ms")]
    pub caught_up_interval_ms: u64,
    /// Minimum spacing between backup polls while the push channel is open.
    #[serde(default = "default_backup_poll_interval_ms")]
    pub backup_poll_interval_ms: u64,
    /// Transaction pipeline cadence, in milliseconds.
    #[serde(default = "default_tx_interval_ms")]
    pub tx_interval_ms: u64,
    /// tx_search page size.
    #[serde(default = "default_tx_per_page")]
    pub tx_per_page: u32,
    /// Keep raw block JSON / raw transaction bytes in the store.
    #[serde(default)]
    pub keep_raw: bool,
    /// Health-probe cadence while stopped on a node failure, in seconds.
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
}

fn default_blocks_per_call() -> u64 {
    50
}

fn default_caught_up_threshold() -> u64 {
    3
}

fn default_catch_up_interval_ms() -> u64 {
    1_000
}

fn default_caught_up_interval_ms() -> u64 {
    5_000
}

fn default_backup_poll_interval_ms() -> u64 {
    30_000
}

fn default_tx_interval_ms() -> u64 {
    2_000
}

fn default_tx_per_page() -> u32 {
    50
}

fn default_recovery_interval_secs() -> u64 {
    30
}

/// Root application configuration, loaded from `config.yaml` at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub postgres: PostgresSettings,
    pub node: NodeSettings,
    pub indexer: IndexerSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }
}
