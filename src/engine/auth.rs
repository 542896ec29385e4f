//! Authentication negotiation with a remembered per-agent preference.
//!
//! After the handshake the negotiator tries, in order: the remembered
//! "skip" preference (direct session creation), the remembered method, and
//! for agents with no preference a direct attempt whose success is
//! remembered as "skip". When none of these yields a session the user is
//! asked to choose. A remembered choice that stops working is cleared so it
//! is never retried in a loop.

use tracing::{debug, info, warn};

use crate::acp::protocol::NewSessionResponse;
use crate::driver::BoxFuture;
use crate::models::auth::AuthPreference;
use crate::registry::AgentRegistry;
use crate::{AppError, Result};

/// Notice shown when a remembered method stops working.
pub const SAVED_METHOD_FAILED: &str = "Saved authentication method failed, please re-authenticate";

/// Notice shown when the user must pick a method.
pub const AUTH_REQUIRED: &str = "Authentication required, choose a method to continue";

/// Protocol steps the negotiator drives.
pub trait SessionOpener: Send + Sync {
    /// Create the session, re-resolving MCP servers for this attempt.
    ///
    /// # Errors
    ///
    /// Returns the agent's error; auth-required surfaces as
    /// [`AppError::Rpc`] with the auth-required code.
    fn open_session(&self) -> BoxFuture<'_, NewSessionResponse>;

    /// Run `method_id`, passing any stored credential.
    ///
    /// # Errors
    ///
    /// Returns the agent's error.
    fn authenticate<'a>(&'a self, method_id: &'a str) -> BoxFuture<'a, ()>;
}

/// Result of negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A session exists.
    Established(NewSessionResponse),
    /// The user has to choose a method.
    NeedsAuthentication,
}

/// Drives the preference chain for one agent.
pub struct AuthNegotiator<'a> {
    registry: &'a dyn AgentRegistry,
    agent: &'a str,
}

impl<'a> AuthNegotiator<'a> {
    /// Create a negotiator for `agent`.
    #[must_use]
    pub fn new(registry: &'a dyn AgentRegistry, agent: &'a str) -> Self {
        Self { registry, agent }
    }

    /// Run the preference chain. User-facing notices are appended to `notices`.
    ///
    /// # Errors
    ///
    /// Only transport failures propagate ([`AppError::Acp`]); every other
    /// failure degrades to [`AuthOutcome::NeedsAuthentication`].
    pub async fn negotiate(
        &self,
        opener: &dyn SessionOpener,
        notices: &mut Vec<String>,
    ) -> Result<AuthOutcome> {
        let preference = match self.registry.auth_preference(self.agent).await {
            Ok(preference) => preference,
            Err(err) => {
                warn!(agent = self.agent, %err, "failed to read auth preference");
                None
            }
        };

        match preference {
            Some(AuthPreference::Skip) => {
                debug!(agent = self.agent, "remembered preference: direct session creation");
                match opener.open_session().await {
                    Ok(session) => return Ok(AuthOutcome::Established(session)),
                    Err(err) => {
                        propagate_transport(&err)?;
                        info!(agent = self.agent, %err, "direct session creation no longer works");
                        self.forget_preference().await;
                    }
                }
            }
            Some(AuthPreference::Method(method_id)) => {
                debug!(agent = self.agent, method_id, "remembered preference: auth method");
                match self.authenticate_and_open(opener, &method_id).await {
                    Ok(session) => return Ok(AuthOutcome::Established(session)),
                    Err(err) => {
                        propagate_transport(&err)?;
                        info!(agent = self.agent, method_id, %err, "remembered auth method failed");
                        self.forget_preference().await;
                        notices.push(SAVED_METHOD_FAILED.to_owned());
                    }
                }
            }
            None => match opener.open_session().await {
                Ok(session) => {
                    self.remember(AuthPreference::Skip).await;
                    return Ok(AuthOutcome::Established(session));
                }
                Err(err) => {
                    propagate_transport(&err)?;
                    if err.is_auth_required() {
                        info!(agent = self.agent, "agent requires authentication");
                    } else {
                        debug!(agent = self.agent, %err, "direct session creation failed");
                    }
                }
            },
        }

        notices.push(AUTH_REQUIRED.to_owned());
        Ok(AuthOutcome::NeedsAuthentication)
    }

    /// Authenticate with a user-chosen method, remember it, and open the session.
    ///
    /// The method is remembered only once the agent accepts it.
    ///
    /// # Errors
    ///
    /// Returns the authentication or session-creation error.
    pub async fn authenticate_explicit(
        &self,
        opener: &dyn SessionOpener,
        method_id: &str,
    ) -> Result<NewSessionResponse> {
        opener.authenticate(method_id).await?;
        self.remember(AuthPreference::Method(method_id.to_owned()))
            .await;
        opener.open_session().await
    }

    /// Authenticate an established session again and remember the method.
    ///
    /// # Errors
    ///
    /// Returns the agent's authentication error.
    pub async fn reauthenticate(&self, opener: &dyn SessionOpener, method_id: &str) -> Result<()> {
        opener.authenticate(method_id).await?;
        self.remember(AuthPreference::Method(method_id.to_owned()))
            .await;
        Ok(())
    }

    /// Open the session without authenticating, remembering "skip" on success.
    ///
    /// # Errors
    ///
    /// Returns the session-creation error.
    pub async fn open_without_auth(&self, opener: &dyn SessionOpener) -> Result<NewSessionResponse> {
        let session = opener.open_session().await?;
        self.remember(AuthPreference::Skip).await;
        Ok(session)
    }

    async fn authenticate_and_open(
        &self,
        opener: &dyn SessionOpener,
        method_id: &str,
    ) -> Result<NewSessionResponse> {
        opener.authenticate(method_id).await?;
        opener.open_session().await
    }

    async fn remember(&self, preference: AuthPreference) {
        if let Err(err) = self
            .registry
            .set_auth_preference(self.agent, preference)
            .await
        {
            warn!(agent = self.agent, %err, "failed to persist auth preference");
        }
    }

    async fn forget_preference(&self) {
        if let Err(err) = self.registry.clear_auth_preference(self.agent).await {
            warn!(agent = self.agent, %err, "failed to clear auth preference");
        }
    }
}

/// A dead transport ends negotiation; nothing else can succeed on it.
fn propagate_transport(err: &AppError) -> Result<()> {
    if matches!(err, AppError::Acp(_)) {
        return Err(err.clone());
    }
    Ok(())
}
