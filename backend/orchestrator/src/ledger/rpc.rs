//! JSON-RPC ledger client.
//!
//! Speaks JSON-RPC 2.0 over HTTP to the ledger gateway:
//!
//! | Method           | Params                                   | Result            |
//! |------------------|------------------------------------------|-------------------|
//! | `sendOperation`  | `circleId`, `component`, `operation`     | `{ txHash }`      |
//! | `getTransaction` | `hash`                                   | transaction state |
//! | `query`          | `circleId`, `component`, `query`         | query value       |
//!
//! This client never retries on its own; failures are mapped to structured
//! [`LedgerError`]s and the caller's [`crate::retry::RetryExecutor`] decides.
//! JSON-RPC codes `-32700` and `-32600..=-32602` are hard failures, other
//! negative codes are node-side trouble and positive codes are contract
//! rejections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{LedgerError, RejectCode, TransportFault};
use crate::events::ReceiptEvent;
use crate::ledger::{Ledger, Operation, Query, Receipt, SubmissionHandle};
use crate::types::{CircleId, ComponentKind};

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResult {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TxStatus {
    Pending,
    NotFound,
    Success,
    Failed,
}

#[derive(Debug, Deserialize)]
struct TransactionResult {
    status: TxStatus,
    ledger: Option<u64>,
    #[serde(default)]
    events: Vec<ReceiptEvent>,
    error: Option<RpcError>,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct RpcLedger {
    client: Client,
    rpc_url: String,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(client: Client, rpc_url: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(LedgerError::transport(
                TransportFault::Unavailable,
                format!("{method}: HTTP {status}"),
            ));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            return Err(map_rpc_error(method, err));
        }

        debug!(method, id, "RPC call returned");
        body.result
            .ok_or_else(|| LedgerError::Decode(format!("{method}: empty result")))
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn submit(
        &self,
        circle: Option<CircleId>,
        component: ComponentKind,
        op: &Operation,
    ) -> Result<SubmissionHandle, LedgerError> {
        let params = json!({
            "circleId": circle,
            "component": component,
            "operation": op,
        });
        let result = self.call("sendOperation", params).await?;
        let sent: SendResult = serde_json::from_value(result)
            .map_err(|e| LedgerError::Decode(format!("sendOperation: {e}")))?;
        debug!(operation = op.name(), tx_hash = %sent.tx_hash, "operation submitted");
        Ok(SubmissionHandle {
            tx_hash: sent.tx_hash,
        })
    }

    async fn wait_for_confirmation(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError> {
        let started = Instant::now();

        loop {
            match self
                .call("getTransaction", json!({ "hash": handle.tx_hash }))
                .await
            {
                Ok(value) => {
                    let tx: TransactionResult = serde_json::from_value(value)
                        .map_err(|e| LedgerError::Decode(format!("getTransaction: {e}")))?;
                    match tx.status {
                        TxStatus::Success => {
                            return Ok(Receipt {
                                tx_hash: handle.tx_hash.clone(),
                                ledger: tx.ledger.unwrap_or_default(),
                                events: tx.events,
                            });
                        }
                        TxStatus::Failed => {
                            let err = tx.error.unwrap_or(RpcError {
                                code: 0,
                                message: "transaction failed without a code".to_string(),
                            });
                            return Err(map_rpc_error(&handle.tx_hash, err));
                        }
                        TxStatus::Pending | TxStatus::NotFound => {}
                    }
                }
                // The submission is out; a flaky poll does not change that.
                Err(LedgerError::Transport { kind, message }) => {
                    debug!(tx_hash = %handle.tx_hash, ?kind, "confirmation poll failed: {message}");
                }
                Err(other) => return Err(other),
            }

            if started.elapsed() >= timeout {
                return Err(LedgerError::ConfirmationTimeout {
                    tx_hash: handle.tx_hash.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn query(
        &self,
        circle: CircleId,
        component: ComponentKind,
        query: &Query,
    ) -> Result<Value, LedgerError> {
        self.call(
            "query",
            json!({
                "circleId": circle,
                "component": component,
                "query": query,
            }),
        )
        .await
    }
}

fn transport_error(e: reqwest::Error) -> LedgerError {
    let kind = if e.is_timeout() {
        TransportFault::Timeout
    } else if e.is_connect() {
        TransportFault::ConnectionReset
    } else {
        TransportFault::Closed
    };
    LedgerError::transport(kind, e.to_string())
}

fn map_rpc_error(context: &str, err: RpcError) -> LedgerError {
    match err.code {
        -32700 | -32602 | -32601 | -32600 => {
            LedgerError::Decode(format!("{context}: RPC hard error {}: {}", err.code, err.message))
        }
        code if code < 0 => LedgerError::transport(
            TransportFault::Unavailable,
            format!("{context}: RPC soft error {code}: {}", err.message),
        ),
        code => LedgerError::Rejected {
            operation: context.to_string(),
            code: RejectCode::from_code(u32::try_from(code).unwrap_or(u32::MAX)),
            message: err.message,
        },
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
