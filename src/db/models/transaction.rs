use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Event;

/// One indexed transaction. `hash` is the uniqueness key; a transaction is
/// immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub height: u64,
    pub index: i32,
    /// ABCI result code; zero means success.
    pub code: i32,
    pub gas_used: i64,
    pub gas_wanted: i64,
    pub fee: Option<serde_json::Value>,
    pub memo: String,
    pub timestamp: DateTime<Utc>,
    /// Raw signed bytes, kept only when `indexer.keep_raw` is set.
    pub raw: Option<Vec<u8>>,
    pub messages: Vec<TransactionMessage>,
    /// Combined, message-attributed event stream (see sync::txs correlation).
    pub events: Vec<Event>,
}

/// One decoded message inside a transaction body, ordered by `index`.
///
/// Rows of this shape are the handoff surface: downstream processors read
/// them back in `(height, index)` order between their own checkpoint and the
/// tx-crawl checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMessage {
    pub tx_hash: String,
    pub height: u64,
    pub index: i32,
    /// Wire type URL, e.g. "/cosmos.bank.v1beta1.MsgSend".
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    pub content: serde_json::Value,
}
