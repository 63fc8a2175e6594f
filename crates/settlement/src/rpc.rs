//! JSON-RPC client for a settlement gateway
//!
//! Methods:
//! - `settlement_submitJob [job]` → `{transactionHash, ledgerJobId, blockNumber}`
//! - `settlement_getJob [ledgerJobId]` → `{ledgerJobId, status, confirmations, blockNumber}` or `null`
//! - `settlement_getEvents [fromBlock]` → `[{ledgerJobId, kind, blockNumber}]`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ledger::EVENT_CHANNEL_CAPACITY;
use crate::{
    Ledger, LedgerEvent, LedgerJobId, LedgerJobState, LedgerReceipt, NegotiatedJob, Result,
    SettlementError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Ledger backed by a JSON-RPC settlement gateway
pub struct RpcLedger {
    client: reqwest::Client,
    rpc_url: reqwest::Url,
    next_id: AtomicU64,
    events: broadcast::Sender<LedgerEvent>,
}

impl RpcLedger {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let rpc_url = reqwest::Url::parse(rpc_url)
            .map_err(|e| SettlementError::RpcError(format!("invalid RPC URL {}: {}", rpc_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SettlementError::RpcError(e.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            client,
            rpc_url,
            next_id: AtomicU64::new(1),
            events,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<serde_json::Value>,
    ) -> Result<Option<T>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(self.rpc_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SettlementError::Unavailable(e.to_string())
                } else {
                    SettlementError::RpcError(format!("{} failed: {}", method, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SettlementError::Unavailable(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let body: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|e| SettlementError::SerializationError(e.to_string()))?;
        if let Some(error) = body.error {
            return Err(SettlementError::RpcError(format!(
                "{} error {}: {}",
                method, error.code, error.message
            )));
        }
        Ok(body.result)
    }

    /// Fetch events at or after `from_block`
    pub async fn events_since(&self, from_block: u64) -> Result<Vec<LedgerEvent>> {
        Ok(self
            .call("settlement_getEvents", vec![serde_json::json!(from_block)])
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn submit_job(&self, job: &NegotiatedJob) -> Result<LedgerReceipt> {
        let params = vec![serde_json::to_value(job)
            .map_err(|e| SettlementError::SerializationError(e.to_string()))?];
        let receipt: Option<LedgerReceipt> = self.call("settlement_submitJob", params).await?;
        receipt.ok_or_else(|| {
            SettlementError::TransactionFailed(format!(
                "no receipt for job {}",
                job.negotiation_id
            ))
        })
    }

    async fn job_state(&self, ledger_job_id: LedgerJobId) -> Result<LedgerJobState> {
        self.call("settlement_getJob", vec![serde_json::json!(ledger_job_id)])
            .await?
            .ok_or(SettlementError::JobNotFound(ledger_job_id))
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}

/// Poll the gateway for events and rebroadcast them to subscribers
pub fn spawn_event_poller(
    ledger: Arc<RpcLedger>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_block = 0u64;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match ledger.events_since(next_block).await {
                Ok(events) => {
                    for event in events {
                        next_block = next_block.max(event.block_number + 1);
                        let _ = ledger.events.send(event);
                    }
                }
                Err(e) => warn!("Ledger event poll failed: {}", e),
            }
        }
        debug!("Ledger event poller stopped");
    })
}
