//! ACP initialization handshake.
//!
//! Sends `initialize` with the host's (empty) client capabilities and checks
//! that the agent settled on a protocol version this host speaks. The reader
//! and writer tasks must already be running, since the response is
//! correlated through [`AcpClient`].

use std::time::Duration;

use tracing::info;

use crate::acp::client::AcpClient;
use crate::acp::protocol::{initialize_params, InitializeResponse, METHOD_INITIALIZE, PROTOCOL_VERSION};
use crate::{AppError, Result};

/// Run the `initialize` exchange.
///
/// # Errors
///
/// - [`AppError::Timeout`] when no answer arrives within `timeout`.
/// - [`AppError::Rpc`] when the agent rejects the request.
/// - [`AppError::Acp`] on a version mismatch or malformed response.
pub async fn initialize(client: &AcpClient, timeout: Duration) -> Result<InitializeResponse> {
    let response: InitializeResponse = client
        .request_as(METHOD_INITIALIZE, initialize_params(), Some(timeout))
        .await?;
    check_protocol_version(&response)?;

    info!(
        protocol_version = response.protocol_version,
        auth_methods = response.auth_methods.len(),
        load_session = response.agent_capabilities.load_session,
        "handshake: initialize complete"
    );
    Ok(response)
}

/// Reject versions other than [`PROTOCOL_VERSION`].
///
/// # Errors
///
/// Returns [`AppError::Acp`] describing the mismatch.
pub fn check_protocol_version(response: &InitializeResponse) -> Result<()> {
    if response.protocol_version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(AppError::Acp(format!(
            "unsupported protocol version {}: host speaks {PROTOCOL_VERSION}",
            response.protocol_version
        )))
    }
}
