//! HTTP client for the CometBFT JSON-RPC endpoints the indexer consumes.
//!
//! Every call is raced against a per-call timeout and retried with
//! exponential backoff up to a bounded attempt count. Retries are exhausted
//! here; callers decide whether an exhausted call is fatal for the cycle.

use std::time::Duration;

use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;

use crate::config::NodeSettings;
use crate::rpc::types::{
    BlockResponse, BlockResultsResponse, JsonRpcResponse, StatusResponse, TxSearchResponse,
};

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

impl RpcClient {
    pub fn new(settings: &NodeSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: settings.rpc_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(settings.rpc_timeout_ms),
            max_retries: settings.rpc_max_retries,
        })
    }

    /// WebSocket endpoint derived from the configured RPC endpoint.
    pub fn websocket_url(&self) -> String {
        let ws = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/websocket", ws)
    }

    async fn call<T: DeserializeOwned>(&self, path_and_query: &str) -> anyhow::Result<T> {
        let url = format!("{}/{}", self.base_url, path_and_query);
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(250 * 2_u64.pow(attempt - 1));
                warn!(
                    "RPC {} failed (attempt {}/{}), retrying in {:?}...",
                    path_and_query, attempt, self.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }

            // First of response or timeout wins; the loser is dropped.
            let result = tokio::time::timeout(self.timeout, self.http.get(&url).send()).await;

            let response = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    last_error = Some(anyhow::anyhow!("request failed: {}", e));
                    continue;
                },
                Err(_) => {
                    last_error =
                        Some(anyhow::anyhow!("request timed out after {:?}", self.timeout));
                    continue;
                },
            };

            if !response.status().is_success() {
                last_error = Some(anyhow::anyhow!(
                    "server returned status {}",
                    response.status()
                ));
                continue;
            }

            let envelope: JsonRpcResponse<T> = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("invalid JSON-RPC response: {}", e));
                    continue;
                },
            };

            if let Some(err) = envelope.error {
                // RPC-level errors (bad height, pruned data) won't improve
                // with retries.
                return Err(anyhow::anyhow!(
                    "RPC error {}: {} {}",
                    err.code,
                    err.message,
                    err.data.unwrap_or_default()
                ));
            }

            return envelope
                .result
                .ok_or_else(|| anyhow::anyhow!("RPC response without result or error"));
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("RPC call failed without error detail"))
            .context(format!("RPC {} exhausted retries", path_and_query)))
    }

    /// Node status: software version and latest height.
    pub async fn status(&self) -> anyhow::Result<StatusResponse> {
        self.call("status").await
    }

    /// Latest known chain height.
    pub async fn latest_height(&self) -> anyhow::Result<u64> {
        Ok(self.status().await?.sync_info.latest_block_height)
    }

    /// Block header, transactions, and last-commit signatures at a height.
    pub async fn block(&self, height: u64) -> anyhow::Result<BlockResponse> {
        self.call(&format!("block?height={}", height)).await
    }

    /// Execution results (events, per-tx results) for a height.
    pub async fn block_results(&self, height: u64) -> anyhow::Result<BlockResultsResponse> {
        self.call(&format!("block_results?height={}", height)).await
    }

    /// One page of transactions at a height.
    pub async fn tx_search(
        &self,
        height: u64,
        page: u32,
        per_page: u32,
    ) -> anyhow::Result<TxSearchResponse> {
        self.call(&format!(
            "tx_search?query=%22tx.height%3D{}%22&page={}&per_page={}&order_by=%22asc%22",
            height, page, per_page
        ))
        .await
    }

    /// Single bounded-timeout reachability probe. Used by the recovery loop;
    /// does not retry.
    pub async fn health_probe(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = tokio::time::timeout(self.timeout, self.http.get(&url).send())
            .await
            .map_err(|_| anyhow::anyhow!("health probe timed out"))?
            .context("health probe request failed")?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "health probe returned status {}",
                response.status()
            ))
        }
    }
}
