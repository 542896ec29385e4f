#![forbid(unsafe_code)]

//! `acp-host`: interactive shell over one ACP agent session.
//!
//! Loads configuration, opens the preference database, starts a session
//! with the chosen agent, and relays prompts from stdin. Logs go to stderr
//! so stdout carries only the conversation.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_host::config::GlobalConfig;
use acp_host::driver::acp_driver::AcpLauncher;
use acp_host::engine::{EngineDeps, PromptOutcome, SessionEngine, SessionSnapshot};
use acp_host::mcp::ConfigMcpCatalog;
use acp_host::models::message::MessageRole;
use acp_host::models::tool_call::ToolCallStatus;
use acp_host::persistence::db;
use acp_host::persistence::preference_repo::PreferenceRepo;
use acp_host::registry::ConfigRegistry;
use acp_host::telemetry::{UsageCounters, UsageRecorder};
use acp_host::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-host", about = "Interactive ACP agent host", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Agent to start; defaults to `default_agent` from the config.
    #[arg(long)]
    agent: Option<String>,

    /// Working directory for the session; defaults to the current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    let agent = args
        .agent
        .or_else(|| config.default_agent.clone())
        .ok_or_else(|| AppError::Config("no --agent given and no default_agent set".into()))?;
    let workspace = match args.workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let workspace = workspace
        .canonicalize()
        .map_err(|err| AppError::Config(format!("invalid workspace: {err}")))?;
    info!(agent, workspace = %workspace.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    info!("database connected");

    // ── Build the engine ────────────────────────────────
    let usage = Arc::new(UsageCounters::new());
    let usage_sink: Arc<dyn UsageRecorder> = Arc::clone(&usage) as Arc<dyn UsageRecorder>;
    let deps = EngineDeps {
        registry: Arc::new(ConfigRegistry::new(
            Arc::clone(&config),
            PreferenceRepo::new(db),
        )),
        launcher: Arc::new(AcpLauncher),
        mcp: Arc::new(ConfigMcpCatalog::new(Arc::clone(&config))),
        usage: usage_sink,
    };
    let engine = Arc::new(SessionEngine::new(
        deps,
        config.timeouts.clone(),
        config.streaming.clone(),
    ));

    let ct = CancellationToken::new();
    let renderer = tokio::spawn(render_loop(Arc::clone(&engine), ct.clone()));

    if let Err(err) = engine.start(&agent, &workspace).await {
        error!(%err, "session start failed");
    }

    tokio::select! {
        result = repl(Arc::clone(&engine)) => {
            if let Err(err) = result {
                error!(%err, "input loop failed");
            }
        }
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    // ── Graceful shutdown ───────────────────────────────
    if let Err(err) = engine.close().await {
        error!(%err, "error while closing the session");
    }
    ct.cancel();
    let _ = renderer.await;

    let totals = usage.snapshot();
    info!(
        sessions = totals.session_starts,
        prompts = totals.prompts,
        tool_calls = totals.tool_calls,
        "acp-host shut down"
    );
    Ok(())
}

/// Read commands and prompts from stdin until `/quit` or end of input.
async fn repl(engine: Arc<SessionEngine>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turn: Option<JoinHandle<()>> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut words = line.split_whitespace();
        let result = match words.next().unwrap_or_default() {
            "/quit" => break,
            "/cancel" => engine.cancel_current_prompt().await,
            "/retry" => engine.retry_start().await,
            "/noauth" => engine.create_session_without_auth().await,
            "/auth" => match words.next() {
                Some(method) => engine.authenticate(method).await,
                None => Err(AppError::InvalidState("usage: /auth <method>".into())),
            },
            "/mode" => match words.next() {
                Some(mode) => engine.set_mode_by_id(mode).await,
                None => Err(AppError::InvalidState("usage: /mode <id>".into())),
            },
            "/model" => match words.next() {
                Some(model) => engine.set_model(model).await,
                None => Err(AppError::InvalidState("usage: /model <id>".into())),
            },
            "/allow" => match (words.next(), words.next()) {
                (Some(request), Some(option)) => engine.respond_permission(request, option).await,
                _ => Err(AppError::InvalidState("usage: /allow <request> <option>".into())),
            },
            _ => {
                if turn.as_ref().is_some_and(|t| !t.is_finished()) {
                    Err(AppError::InvalidState(
                        "a prompt is still running, use /cancel first".into(),
                    ))
                } else {
                    turn = Some(spawn_turn(Arc::clone(&engine), line.to_owned()));
                    Ok(())
                }
            }
        };
        if let Err(err) = result {
            eprintln!("error: {err}");
        }
    }

    if let Some(turn) = turn {
        turn.abort();
    }
    Ok(())
}

fn spawn_turn(engine: Arc<SessionEngine>, prompt: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match engine.send_message(&prompt, Vec::new()).await {
            Ok(PromptOutcome::Completed(reason)) => info!(?reason, "turn finished"),
            Ok(PromptOutcome::NeedsAuthentication) => {
                warn!("agent requires authentication, use /auth <method>");
            }
            Err(err) => error!(%err, "prompt failed"),
        }
    })
}

/// Print completed messages, tool call status changes, and permission requests.
async fn render_loop(engine: Arc<SessionEngine>, ct: CancellationToken) {
    let mut revisions = engine.subscribe();
    let mut printed = HashSet::new();
    let mut tool_status: HashMap<String, ToolCallStatus> = HashMap::new();
    let mut asked = HashSet::new();

    loop {
        tokio::select! {
            () = ct.cancelled() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let snapshot = engine.snapshot().await;
        render(&snapshot, &mut printed, &mut tool_status, &mut asked);
    }
}

fn render(
    snapshot: &SessionSnapshot,
    printed: &mut HashSet<String>,
    tool_status: &mut HashMap<String, ToolCallStatus>,
    asked: &mut HashSet<String>,
) {
    for call in &snapshot.tool_calls {
        if tool_status.get(&call.tool_call_id) != Some(&call.status) {
            tool_status.insert(call.tool_call_id.clone(), call.status);
            let indent = if call.parent_tool_call_id.is_some() { "    " } else { "" };
            println!("{indent}[tool] {} ({:?})", call.title, call.status);
        }
    }

    for message in snapshot.messages.iter().filter(|m| m.is_complete) {
        if !printed.insert(message.id.clone()) || message.role == MessageRole::User {
            continue;
        }
        match message.role {
            MessageRole::Agent => println!("{}\n", message.content),
            MessageRole::System | MessageRole::User => println!("* {}", message.content),
        }
    }

    for permission in &snapshot.permissions {
        if asked.insert(permission.key.clone()) {
            let options: Vec<String> = permission
                .options
                .iter()
                .map(|o| format!("{} ({})", o.option_id, o.name))
                .collect();
            println!(
                "[permission {}] {}: {}",
                permission.key,
                permission.tool_call.title.as_deref().unwrap_or("tool call"),
                options.join(", ")
            );
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
