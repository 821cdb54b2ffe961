use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

use super::{
    AdapterError, BalanceQuery, BalanceReading, ChainAdapter, LogFilter, LogStream, RawEvent,
    Submission, TxHash, TxStatus,
};
use crate::types::ChainId;

const ALREADY_REDEEMED: i64 = -32001;
const INVALID_TARGET: i64 = -32002;
const INSUFFICIENT_FUNDS: i64 = -32003;
const REVERTED: i64 = -32004;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct LogsPage {
    events: Vec<RawEvent>,
    next_block: u64,
}

#[derive(Clone)]
struct RpcClient {
    url: String,
    client: reqwest::Client,
}

impl RpcClient {
    async fn call<R: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<R, AdapterError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout
                } else {
                    AdapterError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AdapterError::Unavailable(format!("HTTP {}", status)));
        }

        let body: RpcResponse<R> = response
            .json()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(classify(error));
        }
        body.result
            .ok_or_else(|| AdapterError::Decode(format!("{} returned no result", method)))
    }
}

fn classify(error: RpcError) -> AdapterError {
    match error.code {
        ALREADY_REDEEMED => AdapterError::AlreadyRedeemed,
        INVALID_TARGET => AdapterError::InvalidTarget(error.message),
        INSUFFICIENT_FUNDS => AdapterError::InsufficientFunds(error.message),
        REVERTED => AdapterError::Reverted(error.message),
        INTERNAL_ERROR => AdapterError::Unavailable(error.message),
        code => AdapterError::Rpc {
            code,
            message: error.message,
        },
    }
}

/// Chain adapter speaking the relay JSON-RPC dialect over HTTP.
pub struct JsonRpcAdapter {
    chain: ChainId,
    rpc: RpcClient,
    log_poll_interval: Duration,
    connected: AtomicBool,
}

impl JsonRpcAdapter {
    pub fn new(chain: ChainId, rpc_url: &str, log_poll_interval: Duration) -> Self {
        Self {
            chain,
            rpc: RpcClient {
                url: rpc_url.to_string(),
                client: reqwest::Client::new(),
            },
            log_poll_interval,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainAdapter for JsonRpcAdapter {
    fn chain(&self) -> ChainId {
        self.chain
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        let remote: u16 = self.rpc.call("relay_chainId", serde_json::json!([])).await?;
        if remote != self.chain.wire_id() {
            return Err(AdapterError::InvalidTarget(format!(
                "node at {} serves chain {}, expected {}",
                self.rpc.url,
                remote,
                self.chain.wire_id()
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to {} at {}", self.chain, self.rpc.url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Disconnected from {}", self.chain);
        Ok(())
    }

    async fn get_balance(&self, query: &BalanceQuery) -> Result<BalanceReading, AdapterError> {
        self.rpc
            .call(
                "relay_getBalance",
                serde_json::json!({ "address": query.address, "token": query.token }),
            )
            .await
    }

    async fn send_transaction(&self, submission: &Submission) -> Result<TxHash, AdapterError> {
        let params = serde_json::to_value(submission).map_err(|e| AdapterError::Decode(e.to_string()))?;
        let hash: String = self.rpc.call("relay_sendTransaction", params).await?;
        debug!("Submitted {} to {} as {}", submission.message_id, self.chain, hash);
        Ok(TxHash(hash))
    }

    async fn get_transaction_status(&self, tx: &TxHash) -> Result<TxStatus, AdapterError> {
        self.rpc
            .call("relay_getTransactionStatus", serde_json::json!({ "hash": tx.0 }))
            .await
    }

    /// Polls `relay_getLogs` from `filter.from_block`, following the
    /// cursor the node returns.
    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, AdapterError> {
        struct Poller {
            rpc: RpcClient,
            filter: LogFilter,
            buffered: VecDeque<RawEvent>,
            interval: Duration,
            first: bool,
        }

        let poller = Poller {
            rpc: self.rpc.clone(),
            filter: filter.clone(),
            buffered: VecDeque::new(),
            interval: self.log_poll_interval,
            first: true,
        };

        let stream = futures::stream::unfold(poller, |mut p| async move {
            loop {
                if let Some(event) = p.buffered.pop_front() {
                    return Some((Ok(event), p));
                }
                if !p.first {
                    sleep(p.interval).await;
                }
                p.first = false;
                let page: Result<LogsPage, _> = p
                    .rpc
                    .call(
                        "relay_getLogs",
                        serde_json::json!({
                            "emitters": p.filter.emitters,
                            "from_block": p.filter.from_block
                        }),
                    )
                    .await;
                match page {
                    Ok(page) => {
                        p.filter.from_block = page.next_block;
                        p.buffered.extend(page.events);
                    }
                    Err(e) => {
                        warn!("relay_getLogs failed at block {}: {}", p.filter.from_block, e);
                        return Some((Err(e), p));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
