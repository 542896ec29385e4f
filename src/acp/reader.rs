//! ACP reader task.
//!
//! Reads NDJSON lines from the agent's stdout, classifies each one as a
//! response, an agent-initiated request, or a notification, and routes it:
//!
//! | Inbound                        | Routed to                                   |
//! |--------------------------------|---------------------------------------------|
//! | response (`id` + result/error) | [`PendingRequests::resolve`]                |
//! | `session/update`               | [`AgentEvent::SessionUpdate`]               |
//! | `session/request_permission`   | [`AgentEvent::PermissionRequested`]         |
//! | any other request              | answered with `-32601 method not found`     |
//! | any other notification         | skipped; logged at `DEBUG`                  |
//!
//! Events are forwarded in wire order, and a response is only resolved after
//! every notification that preceded it on the wire has been queued.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::client::{error_frame, PendingRequests};
use crate::acp::codec::AcpCodec;
use crate::acp::protocol::{
    self, RpcErrorObject, METHOD_NOT_FOUND_CODE, METHOD_REQUEST_PERMISSION, METHOD_SESSION_UPDATE,
};
use crate::driver::AgentEvent;
use crate::{AppError, Result};

/// JSON-RPC "invalid params" error code.
const INVALID_PARAMS_CODE: i64 = -32602;

// ── Inbound classification ────────────────────────────────────────────────────

/// One classified inbound JSON-RPC message.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Answer to one of our requests.
    Response {
        /// Correlation id.
        id: u64,
        /// Result, or the agent's error object mapped to [`AppError::Rpc`].
        outcome: Result<Value>,
    },
    /// Agent-initiated request that expects an answer.
    Request {
        /// Correlation id, echoed back verbatim.
        id: Value,
        /// Method name.
        method: String,
        /// Params object.
        params: Value,
    },
    /// Agent-initiated notification.
    Notification {
        /// Method name.
        method: String,
        /// Params object.
        params: Value,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Classify a single NDJSON line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// - [`AppError::Acp`]`("malformed json: …")` when the line is not JSON.
/// - [`AppError::Acp`] when the message has neither `method` nor a numeric `id`.
pub fn parse_inbound_line(line: &str) -> Result<Option<Inbound>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(line)?;

    if let Some(method) = envelope.method {
        return Ok(Some(match envelope.id {
            Some(id) if !id.is_null() => Inbound::Request {
                id,
                method,
                params: envelope.params,
            },
            _ => Inbound::Notification {
                method,
                params: envelope.params,
            },
        }));
    }

    let Some(id) = envelope.id.as_ref().and_then(Value::as_u64) else {
        return Err(AppError::Acp(
            "message has neither a method nor a numeric id".into(),
        ));
    };

    let outcome = match envelope.error {
        Some(error) => Err(AppError::from(error)),
        None => Ok(envelope.result),
    };
    Ok(Some(Inbound::Response { id, outcome }))
}

// ── Reader task ───────────────────────────────────────────────────────────────

/// Channels the reader routes inbound traffic into.
#[derive(Debug, Clone)]
pub struct ReaderRoutes {
    /// Requests awaiting responses.
    pub pending: Arc<PendingRequests>,
    /// Engine event sink.
    pub events: mpsc::Sender<AgentEvent>,
    /// Outbound frames, used to answer unsupported requests.
    pub outbound: mpsc::Sender<Value>,
}

/// Read `stdout` until EOF, an I/O error, or cancellation.
///
/// On EOF or I/O error every pending request fails with `"stream closed"` and
/// [`AgentEvent::StreamClosed`] is emitted. Cancellation fails pending
/// requests but emits nothing, since the caller is already tearing down.
/// Oversized and malformed lines are logged and skipped.
pub async fn run_reader<R>(agent: String, stdout: R, routes: ReaderRoutes, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AcpCodec::new());
    // `FramedRead` yields one `None` after a decoder error before resuming.
    let mut resuming = false;

    let reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(agent, "acp reader: cancellation received, stopping");
                routes.pending.fail_all("connection terminated").await;
                return;
            }

            item = framed.next() => match item {
                None if resuming => resuming = false,
                None => {
                    debug!(agent, "acp reader: EOF detected");
                    break "stream closed".to_owned();
                }
                Some(Err(AppError::Acp(msg))) => {
                    warn!(agent, error = msg.as_str(), "acp reader: framing error, skipping line");
                    resuming = true;
                }
                Some(Err(e)) => {
                    warn!(agent, error = %e, "acp reader: IO error, stopping");
                    break format!("stream error: {e}");
                }
                Some(Ok(line)) => match parse_inbound_line(&line) {
                    Ok(Some(inbound)) => {
                        if !route(&agent, inbound, &routes).await {
                            debug!(agent, "acp reader: event sink closed, stopping");
                            routes.pending.fail_all("connection terminated").await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(agent, error = %e, "acp reader: dropping unparseable line");
                    }
                },
            },
        }
    };

    routes.pending.fail_all("stream closed").await;
    if routes
        .events
        .send(AgentEvent::StreamClosed { reason })
        .await
        .is_err()
    {
        debug!(agent, "acp reader: event sink gone before stream-closed delivery");
    }
}

/// Route one inbound message. Returns `false` once the event sink is gone.
async fn route(agent: &str, inbound: Inbound, routes: &ReaderRoutes) -> bool {
    match inbound {
        Inbound::Response { id, outcome } => {
            if !routes.pending.resolve(id, outcome).await {
                debug!(agent, id, "acp reader: response for unknown or expired request");
            }
            true
        }

        Inbound::Notification { method, params } if method == METHOD_SESSION_UPDATE => {
            match protocol::decode_session_update(params) {
                Ok(notification) => routes
                    .events
                    .send(AgentEvent::SessionUpdate {
                        session_id: notification.session_id,
                        update: Box::new(notification.update),
                    })
                    .await
                    .is_ok(),
                Err(e) => {
                    warn!(agent, error = %e, "acp reader: dropping malformed session/update");
                    true
                }
            }
        }

        Inbound::Notification { method, .. } => {
            debug!(agent, method, "acp reader: skipping unknown notification");
            true
        }

        Inbound::Request { id, method, params } if method == METHOD_REQUEST_PERMISSION => {
            match protocol::decode_permission_request(params) {
                Ok(request) => routes
                    .events
                    .send(AgentEvent::PermissionRequested {
                        request_id: id,
                        request: Box::new(request),
                    })
                    .await
                    .is_ok(),
                Err(e) => {
                    warn!(agent, error = %e, "acp reader: rejecting malformed permission request");
                    reply(routes, error_frame(id, INVALID_PARAMS_CODE, "invalid params")).await;
                    true
                }
            }
        }

        Inbound::Request { id, method, .. } => {
            debug!(agent, method, "acp reader: answering unsupported request");
            reply(
                routes,
                error_frame(id, METHOD_NOT_FOUND_CODE, &format!("method not found: {method}")),
            )
            .await;
            true
        }
    }
}

async fn reply(routes: &ReaderRoutes, frame: Value) {
    if routes.outbound.send(frame).await.is_err() {
        debug!("acp reader: writer gone, reply dropped");
    }
}
