//! Agent registry: executable resolution, persisted preferences, credentials.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::acp::protocol::AgentCapabilities;
use crate::config::{self, GlobalConfig};
use crate::driver::BoxFuture;
use crate::models::auth::{AuthMethod, AuthPreference};
use crate::persistence::preference_repo::PreferenceRepo;

/// A registered agent whose executable was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAgent {
    /// Agent name.
    pub name: String,
    /// Absolute executable path.
    pub command: PathBuf,
    /// Launch arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
}

/// Registry collaborator consulted by the session engine.
pub trait AgentRegistry: Send + Sync {
    /// Resolve `agent` to a runnable executable, or `None` when it is not
    /// registered or not executable.
    fn resolve(&self, agent: &str) -> Option<ResolvedAgent>;

    /// Remembered auth preference.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on storage failure.
    fn auth_preference<'a>(&'a self, agent: &'a str) -> BoxFuture<'a, Option<AuthPreference>>;

    /// Remember an auth preference.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on storage failure.
    fn set_auth_preference<'a>(
        &'a self,
        agent: &'a str,
        preference: AuthPreference,
    ) -> BoxFuture<'a, ()>;

    /// Forget the auth preference.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on storage failure.
    fn clear_auth_preference<'a>(&'a self, agent: &'a str) -> BoxFuture<'a, ()>;

    /// Record what the agent advertised at handshake.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on storage failure.
    fn record_capabilities<'a>(
        &'a self,
        agent: &'a str,
        capabilities: AgentCapabilities,
        auth_methods: Vec<AuthMethod>,
    ) -> BoxFuture<'a, ()>;

    /// Stored credential for an auth method, if any.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`](crate::AppError::Config) if the keychain
    /// cannot be queried.
    fn credential<'a>(&'a self, agent: &'a str, method_id: &'a str)
        -> BoxFuture<'a, Option<String>>;
}

/// [`AgentRegistry`] backed by the config file, `SQLite`, and the OS keychain.
#[derive(Clone)]
pub struct ConfigRegistry {
    config: Arc<GlobalConfig>,
    repo: PreferenceRepo,
}

impl ConfigRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, repo: PreferenceRepo) -> Self {
        Self { config, repo }
    }
}

impl AgentRegistry for ConfigRegistry {
    fn resolve(&self, agent: &str) -> Option<ResolvedAgent> {
        let Some(entry) = self.config.agent(agent) else {
            debug!(agent, "agent is not registered");
            return None;
        };
        let Some(command) = resolve_executable(&entry.command) else {
            warn!(agent, command = entry.command, "agent executable not found or not executable");
            return None;
        };
        Some(ResolvedAgent {
            name: agent.to_owned(),
            command,
            args: entry.args.clone(),
            env: entry.env.clone(),
        })
    }

    fn auth_preference<'a>(&'a self, agent: &'a str) -> BoxFuture<'a, Option<AuthPreference>> {
        Box::pin(self.repo.auth_preference(agent))
    }

    fn set_auth_preference<'a>(
        &'a self,
        agent: &'a str,
        preference: AuthPreference,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.repo.set_auth_preference(agent, &preference).await })
    }

    fn clear_auth_preference<'a>(&'a self, agent: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.repo.clear_auth_preference(agent))
    }

    fn record_capabilities<'a>(
        &'a self,
        agent: &'a str,
        capabilities: AgentCapabilities,
        auth_methods: Vec<AuthMethod>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.repo
                .save_capabilities(agent, &capabilities, &auth_methods)
                .await
        })
    }

    fn credential<'a>(
        &'a self,
        agent: &'a str,
        method_id: &'a str,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let env_key = self
                .config
                .agent(agent)
                .and_then(|a| a.credentials.get(method_id))
                .map(String::as_str);
            config::load_credential(agent, method_id, env_key).await
        })
    }
}

/// Resolve a command to an executable file.
///
/// Commands containing a path separator are checked as given; bare names are
/// searched on `PATH`.
#[must_use]
pub fn resolve_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
