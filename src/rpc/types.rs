//! Serde mappings for the CometBFT JSON-RPC surface the indexer consumes.
//!
//! CometBFT encodes 64-bit integers as JSON strings; the `string_u64` and
//! `string_i64_field` helpers deal with that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub fn string_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    let s = String::deserialize(de)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// JSON-RPC 2.0 envelope.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<String>,
}

// ==================== /status ====================

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub node_info: NodeInfo,
    pub sync_info: SyncInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    /// CometBFT software version, e.g. "0.38.11". Drives the
    /// version-dependent event attribute codec.
    pub version: String,
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncInfo {
    #[serde(deserialize_with = "string_u64")]
    pub latest_block_height: u64,
    #[serde(default)]
    pub catching_up: bool,
}

// ==================== /block ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub block_id: BlockId,
    pub block: BlockBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBody {
    pub header: BlockHeader,
    pub data: BlockData,
    #[serde(default)]
    pub last_commit: Option<LastCommit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    #[serde(deserialize_with = "string_u64")]
    pub height: u64,
    pub time: DateTime<Utc>,
    pub proposer_address: String,
    #[serde(default)]
    pub chain_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    /// Base64-encoded signed transaction bytes, in block order.
    #[serde(default)]
    pub txs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastCommit {
    #[serde(default)]
    pub signatures: Vec<CommitSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSignature {
    #[serde(default)]
    pub validator_address: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signature: Option<String>,
}

// ==================== /block_results ====================

#[derive(Debug, Clone, Deserialize)]
pub struct BlockResultsResponse {
    #[serde(deserialize_with = "string_u64")]
    pub height: u64,
    #[serde(default)]
    pub txs_results: Option<Vec<TxResult>>,
    #[serde(default)]
    pub begin_block_events: Option<Vec<AbciEvent>>,
    #[serde(default)]
    pub end_block_events: Option<Vec<AbciEvent>>,
    /// CometBFT >= 0.38 merges begin/end block events into one list.
    #[serde(default)]
    pub finalize_block_events: Option<Vec<AbciEvent>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxResult {
    #[serde(default)]
    pub code: i32,
    #[serde(default = "default_i64_zero", deserialize_with = "string_i64_field")]
    pub gas_wanted: i64,
    #[serde(default = "default_i64_zero", deserialize_with = "string_i64_field")]
    pub gas_used: i64,
    /// Stringified JSON with per-message event attribution. Empty on
    /// failed transactions and on chains that dropped the field.
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub events: Vec<AbciEvent>,
}

fn default_i64_zero() -> i64 {
    0
}

fn string_i64_field<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }
    match Raw::deserialize(de)? {
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

/// An ABCI event as it appears on the wire. Attribute key/value may be
/// base64-encoded depending on node version; see `registry::attributes`.
#[derive(Debug, Clone, Deserialize)]
pub struct AbciEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<AbciEventAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbciEventAttribute {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Per-message entry parsed out of `TxResult::log`.
#[derive(Debug, Clone, Deserialize)]
pub struct TxLogEntry {
    #[serde(default)]
    pub msg_index: u32,
    #[serde(default)]
    pub events: Vec<AbciEvent>,
}

// ==================== /tx_search ====================

#[derive(Debug, Clone, Deserialize)]
pub struct TxSearchResponse {
    #[serde(default)]
    pub txs: Vec<TxSearchResult>,
    #[serde(deserialize_with = "string_u64")]
    pub total_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxSearchResult {
    pub hash: String,
    #[serde(deserialize_with = "string_u64")]
    pub height: u64,
    #[serde(default)]
    pub index: i32,
    pub tx_result: TxResult,
    /// Base64-encoded signed transaction bytes.
    pub tx: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_response() {
        let json = r#"{
            "node_info": {"version": "0.38.11", "network": "veridex-1"},
            "sync_info": {"latest_block_height": "12345", "catching_up": false}
        }"#;
        let status: StatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(status.sync_info.latest_block_height, 12345);
        assert_eq!(status.node_info.version, "0.38.11");
    }

    #[test]
    fn parses_tx_result_with_string_gas() {
        let json = r#"{
            "code": 0,
            "gas_wanted": "200000",
            "gas_used": "87654",
            "log": "",
            "events": [{"type": "transfer", "attributes": [{"key": "amount", "value": "10stake"}]}]
        }"#;
        let result: TxResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.gas_used, 87654);
        assert_eq!(result.events[0].kind, "transfer");
    }

    #[test]
    fn parses_tx_log_entries() {
        let json = r#"[{"msg_index": 0, "events": [{"type": "message", "attributes": []}]},
                       {"msg_index": 1, "events": []}]"#;
        let entries: Vec<TxLogEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].msg_index, 1);
    }
}
