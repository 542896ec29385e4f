//! Per-agent auth preference and capability repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::acp::protocol::AgentCapabilities;
use crate::models::auth::{AuthMethod, AuthPreference};
use crate::{AppError, Result};

use super::db::Database;

/// Capabilities an agent advertised at its last successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRecord {
    /// Agent name.
    pub agent_name: String,
    /// Advertised capabilities.
    pub capabilities: AgentCapabilities,
    /// Advertised auth methods.
    pub auth_methods: Vec<AuthMethod>,
    /// When the handshake happened.
    pub recorded_at: DateTime<Utc>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CapabilityRow {
    agent_name: String,
    capabilities: String,
    auth_methods: String,
    recorded_at: String,
}

impl CapabilityRow {
    fn into_record(self) -> Result<CapabilityRecord> {
        let capabilities = serde_json::from_str(&self.capabilities)
            .map_err(|e| AppError::Db(format!("invalid capabilities json: {e}")))?;
        let auth_methods = serde_json::from_str(&self.auth_methods)
            .map_err(|e| AppError::Db(format!("invalid auth_methods json: {e}")))?;
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map_err(|e| AppError::Db(format!("invalid recorded_at: {e}")))?
            .with_timezone(&Utc);

        Ok(CapabilityRecord {
            agent_name: self.agent_name,
            capabilities,
            auth_methods,
            recorded_at,
        })
    }
}

/// Repository for data that outlives a single session.
#[derive(Clone)]
pub struct PreferenceRepo {
    db: Arc<Database>,
}

impl PreferenceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch the remembered auth preference for `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn auth_preference(&self, agent: &str) -> Result<Option<AuthPreference>> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT method_id FROM auth_preference WHERE agent_name = ?1")
                .bind(agent)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(stored.as_deref().map(AuthPreference::from_stored))
    }

    /// Insert or replace the auth preference for `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn set_auth_preference(&self, agent: &str, preference: &AuthPreference) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_preference (agent_name, method_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_name) DO UPDATE SET
                 method_id = excluded.method_id,
                 updated_at = excluded.updated_at",
        )
        .bind(agent)
        .bind(preference.as_stored())
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Remove the auth preference for `agent`. Removing a missing one is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear_auth_preference(&self, agent: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth_preference WHERE agent_name = ?1")
            .bind(agent)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Record the capabilities advertised by `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialisation or the upsert fails.
    pub async fn save_capabilities(
        &self,
        agent: &str,
        capabilities: &AgentCapabilities,
        auth_methods: &[AuthMethod],
    ) -> Result<()> {
        let capabilities = serde_json::to_string(capabilities)
            .map_err(|e| AppError::Db(format!("failed to encode capabilities: {e}")))?;
        let auth_methods = serde_json::to_string(auth_methods)
            .map_err(|e| AppError::Db(format!("failed to encode auth_methods: {e}")))?;

        sqlx::query(
            "INSERT INTO agent_capability (agent_name, capabilities, auth_methods, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_name) DO UPDATE SET
                 capabilities = excluded.capabilities,
                 auth_methods = excluded.auth_methods,
                 recorded_at = excluded.recorded_at",
        )
        .bind(agent)
        .bind(capabilities)
        .bind(auth_methods)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch the last recorded capabilities for `agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the stored JSON is invalid.
    pub async fn capabilities(&self, agent: &str) -> Result<Option<CapabilityRecord>> {
        let row: Option<CapabilityRow> = sqlx::query_as(
            "SELECT agent_name, capabilities, auth_methods, recorded_at
             FROM agent_capability
             WHERE agent_name = ?1",
        )
        .bind(agent)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(CapabilityRow::into_record).transpose()
    }
}
