//! WebSocket push subscription for "new block" notifications.
//!
//! A single long-lived connection to the node's `/websocket` endpoint with a
//! `tm.event='NewBlock'` subscription. Each announced height is forwarded on
//! a channel; a disconnect is reported the same way so the sync engine can
//! schedule exactly one reconnect attempt. Reconnect policy lives in the
//! engine, not here.

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// Events delivered to the sync engine from the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    /// The node announced a new block at this height.
    NewBlock(u64),
    /// The connection dropped; the subscription is gone.
    Disconnected,
}

/// Open the subscription and spawn a reader task.
///
/// The task runs until the connection drops or `cancel` fires. On a drop it
/// sends one `Disconnected` and exits; it never reconnects on its own.
pub fn spawn_new_block_subscription(
    ws_url: String,
    tx: mpsc::Sender<PushEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_subscription(&ws_url, &tx, &cancel).await {
            warn!("New-block subscription ended: {:#}", e);
        }
        if !cancel.is_cancelled() {
            let _ = tx.send(PushEvent::Disconnected).await;
        }
    })
}

async fn run_subscription(
    ws_url: &str,
    tx: &mpsc::Sender<PushEvent>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (stream, _) = connect_async(ws_url)
        .await
        .context("Failed to connect to node websocket")?;
    let (mut sink, mut reader) = stream.split();

    let subscribe = json!({
        "jsonrpc": "2.0",
        "method": "subscribe",
        "id": 1,
        "params": { "query": "tm.event='NewBlock'" }
    });
    sink.send(Message::Text(subscribe.to_string()))
        .await
        .context("Failed to send subscribe request")?;

    info!("Subscribed to new-block events at {}", ws_url);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = reader.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(anyhow::anyhow!("websocket read error: {}", e)),
                    None => return Err(anyhow::anyhow!("websocket stream closed by peer")),
                };

                match msg {
                    Message::Text(text) => {
                        if let Some(height) = extract_height(&text) {
                            if tx.send(PushEvent::NewBlock(height)).await.is_err() {
                                // Engine side went away; nothing left to do.
                                return Ok(());
                            }
                        }
                    },
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    },
                    Message::Close(_) => {
                        return Err(anyhow::anyhow!("websocket closed by node"));
                    },
                    _ => {},
                }
            }
        }
    }
}

/// Pull the announced height out of a NewBlock event frame. Returns None for
/// the subscribe ack and any frame that isn't a NewBlock event.
fn extract_height(text: &str) -> Option<u64> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("Ignoring unparseable websocket frame: {}", e);
            return None;
        },
    };

    value
        .pointer("/result/data/value/block/header/height")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_height_from_new_block_frame() {
        let frame = r#"{
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "data": {
                    "type": "tendermint/event/NewBlock",
                    "value": { "block": { "header": { "height": "4242" } } }
                }
            }
        }"#;
        assert_eq!(extract_height(frame), Some(4242));
    }

    #[test]
    fn ignores_subscribe_ack() {
        let ack = r#"{"jsonrpc": "2.0", "id": 1, "result": {}}"#;
        assert_eq!(extract_height(ack), None);
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(extract_height("not json"), None);
    }
}
