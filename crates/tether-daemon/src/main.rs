//! `tether`: bridge a local AI coding session to remote viewers.
//!
//! Loads `~/.tether/bridge.json` (plus `TETHER_*` overrides and flags), opens
//! the SQLite store, connects to the relay (or runs local-only without one),
//! announces machine presence and runs one session until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use tether_core::ids::UserId;
use tether_core::logging::init_subscriber;
use tether_core::models::MachineStatus;
use tether_runtime::{
    BridgeMode, Collaborators, OrchestratorConfig, OrchestratorEvent, ProcessEngine,
    ProcessTerminal, SessionOrchestrator,
};
use tether_settings::{BridgeSettings, FileSettingsStore, load_settings};
use tether_store::{BridgeStore, SqliteStore};
use tether_transport::{
    HealthConfig, MachinePresence, MemoryRelay, Relay, TransportConfig, WsRelay,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Prompts go to the AI engine.
    Agent,
    /// Keystrokes go to a shell.
    Terminal,
}

#[derive(Debug, Parser)]
#[command(name = "tether", about = "Bridge a local AI coding session to remote viewers")]
struct Args {
    /// Owning user id.
    #[arg(long, env = "TETHER_USER")]
    user: String,

    /// Relay websocket URL; runs local-only when absent.
    #[arg(long, env = "TETHER_RELAY_URL")]
    relay_url: Option<String>,

    /// Relay API key.
    #[arg(long, env = "TETHER_API_KEY")]
    api_key: Option<String>,

    /// Database file.
    #[arg(long, env = "TETHER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Working directory of the session.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// What `input` drives.
    #[arg(long, value_enum, default_value = "agent")]
    mode: Mode,

    /// Model for the new session.
    #[arg(long, env = "TETHER_MODEL")]
    model: Option<String>,

    /// Hostname this machine registers under.
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    hostname: String,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log as JSON lines.
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_subscriber(&args.log_level, args.log_json);

    let mut settings = load_settings().context("failed to load bridge settings")?;
    apply_args(&mut settings, &args);

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| settings.storage.resolved_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store: Arc<dyn BridgeStore> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?,
    );

    let relay: Arc<dyn Relay> = match (&settings.relay.url, &settings.relay.api_key) {
        (Some(url), api_key) => Arc::new(
            WsRelay::connect(
                url,
                api_key.as_deref().unwrap_or_default(),
                std::time::Duration::from_millis(settings.relay.heartbeat_interval_ms),
            )
            .await
            .with_context(|| format!("failed to connect to relay {url}"))?,
        ),
        (None, _) => {
            warn!("no relay configured, running local-only");
            Arc::new(MemoryRelay::new().client())
        }
    };

    let cwd = match args.cwd.clone() {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let user_id = UserId::from(args.user.as_str());
    let machine = store
        .register_machine(&user_id, &args.hostname, &args.hostname)
        .await
        .context("failed to register machine")?;
    let presence = MachinePresence::announce(Arc::clone(&relay), machine.id.clone())
        .await
        .context("failed to announce machine presence")?;

    let config = OrchestratorConfig {
        mode: match args.mode {
            Mode::Agent => BridgeMode::Agent,
            Mode::Terminal => BridgeMode::Terminal,
        },
        model: settings.engine.default_model.clone(),
        permission_mode: settings.engine.permission_mode,
        transport: TransportConfig {
            subscribe_timeout: settings.transport.subscribe_timeout(),
            persist: settings.transport.persist_messages,
        },
        health: HealthConfig {
            heartbeat_interval: settings.health.heartbeat_interval(),
            liveness_timeout: settings.health.liveness_timeout(),
            backoff: settings.health.reconnect.clone(),
        },
        terminal_command: std::env::var("SHELL").unwrap_or_else(|_| "bash".to_owned()),
        ..OrchestratorConfig::new(user_id, args.hostname.clone(), cwd.clone())
    };
    let orchestrator = SessionOrchestrator::new(
        config,
        Collaborators {
            relay,
            store: Arc::clone(&store),
            settings: Arc::new(FileSettingsStore::new(settings.settings_store.resolved_path())),
            engine: Arc::new(ProcessEngine::new(
                settings.engine.command.clone(),
                settings.engine.extra_args.clone(),
                cwd,
                settings.engine.default_model.clone(),
            )),
            terminal: Arc::new(ProcessTerminal::new()),
        },
    );

    let mut events = orchestrator.subscribe();
    let _ = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::Notification { message } => info!("{message}"),
                OrchestratorEvent::Error { message } => warn!("{message}"),
                OrchestratorEvent::Started { session_id } => info!(%session_id, "session live"),
                OrchestratorEvent::Stopped { session_id } => info!(%session_id, "session ended"),
            }
        }
    });

    let session_id = orchestrator.start().await.context("failed to start session")?;
    println!("session {session_id} on machine {}", machine.id);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    orchestrator.stop().await.context("failed to stop session")?;
    presence.withdraw().await;
    store
        .set_machine_status(&machine.id, MachineStatus::Offline)
        .await
        .context("failed to mark machine offline")?;
    Ok(())
}

fn apply_args(settings: &mut BridgeSettings, args: &Args) {
    if let Some(url) = &args.relay_url {
        settings.relay.url = Some(url.clone());
    }
    if let Some(key) = &args.api_key {
        settings.relay.api_key = Some(key.clone());
    }
    if let Some(model) = &args.model {
        settings.engine.default_model = Some(model.clone());
    }
}
