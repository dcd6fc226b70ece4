use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Checkpoint key for the block crawl stage.
pub const JOB_BLOCK_CRAWL: &str = "block-crawl";
/// Checkpoint key for the transaction crawl stage.
pub const JOB_TX_CRAWL: &str = "tx-crawl";

/// Per-stage ingestion progress checkpoint (PostgreSQL).
///
/// One row per pipeline stage, keyed by `job_name`. The height is the single
/// source of truth for how far that stage has progressed and is only ever
/// advanced in the same transaction as the rows it protects, so a stage can
/// resume after a restart without losing or duplicating data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_name: String,
    pub height: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_name: &str, height: u64) -> Self {
        Self {
            job_name: job_name.to_string(),
            height,
            updated_at: Utc::now(),
        }
    }
}
