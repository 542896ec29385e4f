//! JSON-RPC 2.0 request/response correlation over the ACP writer channel.
//!
//! Outbound requests get monotonically increasing numeric ids. Each request
//! parks a [`oneshot`] sender in [`PendingRequests`]; the reader task
//! resolves it when the matching response line arrives, or fails every
//! parked request when the stream ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Requests awaiting a response, keyed by JSON-RPC id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request and return the receiver for its outcome.
    pub async fn register(&self, id: u64) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id, tx);
        rx
    }

    /// Deliver the outcome for `id`. Returns `false` if nothing was waiting.
    pub async fn resolve(&self, id: u64, outcome: Result<Value>) -> bool {
        let Some(tx) = self.inner.lock().await.remove(&id) else {
            return false;
        };
        // The caller may have timed out and dropped the receiver.
        let _ = tx.send(outcome);
        true
    }

    /// Drop a parked request without resolving it.
    pub async fn forget(&self, id: u64) {
        self.inner.lock().await.remove(&id);
    }

    /// Fail every parked request with `AppError::Acp(reason)`.
    pub async fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = self.inner.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "failing pending acp requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(AppError::Acp(reason.to_owned())));
        }
    }

    /// Number of requests still waiting.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no request is waiting.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Handle for issuing JSON-RPC calls to one agent process.
#[derive(Debug, Clone)]
pub struct AcpClient {
    next_id: Arc<AtomicU64>,
    pending: Arc<PendingRequests>,
    outbound: mpsc::Sender<Value>,
}

impl AcpClient {
    /// Build a client writing to `outbound` and correlating through `pending`.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Value>, pending: Arc<PendingRequests>) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending,
            outbound,
        }
    }

    /// Send a request and wait for its result.
    ///
    /// `timeout` of `None` waits until the response arrives or the stream ends.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the agent answers with an error object.
    /// - [`AppError::Timeout`] when `timeout` elapses first.
    /// - [`AppError::Acp`] when the stream is closed.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id).await;

        if self.outbound.send(request_frame(id, method, params)).await.is_err() {
            self.pending.forget(id).await;
            return Err(AppError::Acp("write failed: stream closed".into()));
        }
        debug!(id, method, "acp request sent");

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    self.pending.forget(id).await;
                    warn!(id, method, ?limit, "acp request timed out");
                    return Err(AppError::Timeout(format!(
                        "{method} did not complete within {limit:?}"
                    )));
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| Err(AppError::Acp("stream closed".into())))
    }

    /// Send a request and deserialise its result into `T`.
    ///
    /// # Errors
    ///
    /// Same as [`AcpClient::request`], plus [`AppError::Acp`] when the result
    /// does not match `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let value = self.request(method, params, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Acp(format!("invalid {method} response: {e}")))
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`] when the stream is closed.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.send_frame(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    /// Answer an agent-initiated request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`] when the stream is closed.
    pub async fn respond(&self, id: Value, result: Value) -> Result<()> {
        self.send_frame(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await
    }

    async fn send_frame(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| AppError::Acp("write failed: stream closed".into()))
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Build a request frame.
#[must_use]
pub fn request_frame(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Build an error response frame.
#[must_use]
pub fn error_frame(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
