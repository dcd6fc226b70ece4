use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Event;

/// One indexed block. Height is the idempotency key: a block is inserted
/// exactly once and never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub time: DateTime<Utc>,
    pub proposer_address: String,
    pub tx_count: i32,
    /// Raw block JSON, kept only when `indexer.keep_raw` is set.
    pub raw: Option<serde_json::Value>,
    pub signatures: Vec<BlockSignature>,
    /// begin_block and end_block events, in source order.
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSignature {
    pub validator_address: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub signature: Option<String>,
}
