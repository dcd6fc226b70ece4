use serde::{Deserialize, Serialize};

/// Where an event was emitted from within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    BeginBlock,
    EndBlock,
    Tx,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::BeginBlock => "begin_block",
            EventSource::EndBlock => "end_block",
            EventSource::Tx => "tx",
        }
    }
}

/// A decoded ABCI event with its attributes in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub height: u64,
    /// Present only for tx-sourced events.
    pub tx_hash: Option<String>,
    /// Index of the message that produced this event, when attributable.
    pub msg_index: Option<i32>,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: EventSource,
    pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
    pub index: i32,
}

impl EventAttribute {
    /// `type + "." + key`, the lookup key downstream queries filter on.
    pub fn composite_key(&self, event_type: &str) -> String {
        format!("{}.{}", event_type, self.key)
    }
}
