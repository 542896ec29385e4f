//! ACP writer task.
//!
//! Receives outbound JSON frames from a tokio [`mpsc`] channel, encodes each
//! one as a single NDJSON line with [`AcpCodec`], and writes it to the
//! agent's stdin.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::{AppError, Result};

/// Serialise frames from `msg_rx` onto `stdin` until cancelled or the channel closes.
///
/// # Errors
///
/// Returns [`AppError::Acp`]`("write failed: …")` when the agent's stdin is
/// gone (the process exited).
pub async fn run_writer<W>(
    agent: String,
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<serde_json::Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(agent, "acp writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(agent, "acp writer: message channel closed, stopping");
                    break;
                };

                buf.clear();
                codec.encode(value.to_string(), &mut buf)?;

                let written = async {
                    stdin.write_all(&buf).await?;
                    stdin.flush().await
                };
                written.await.map_err(|e| {
                    warn!(agent, error = %e, "acp writer: write to stdin failed");
                    AppError::Acp(format!("write failed: {e}"))
                })?;
            }
        }
    }

    Ok(())
}
