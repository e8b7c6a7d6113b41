//! Session Orchestrator.
//!
//! Owns one bridged session from `start` to `stop`:
//!
//! ```text
//! stopped ─start─▶ starting ─registered, session created, channels joined─▶ running
//!    ▲                                                                        │
//!    └──────────────────────────── ending ◀──────────────stop─────────────────┘
//! ```
//!
//! Inbound messages flow transport → dispatcher → work queues. Requests are
//! answered by the [`CommandResponder`]; `input` goes to the AI engine (or the
//! terminal) on a single serial worker so prompts never interleave.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tether_core::errors::BridgeError;
use tether_core::ids::{SessionId, UserId};
use tether_core::messages::{MessageBody, MessageType, PermissionMode, RealtimeMessage};
use tether_core::models::{Session, SessionUpdate};
use tether_settings::SettingsStore;
use tether_store::BridgeStore;
use tether_transport::{
    ChannelTransport, ConnectionHealthMonitor, ConnectionState, Endpoint, HealthConfig,
    HealthEvent, MessageDispatcher, Relay, TransportConfig, TransportEvent,
};

use crate::adapter::{AiSessionAdapter, ModelEvent};
use crate::engine::{AiEngine, EngineEvent};
use crate::protocol::{CommandResponder, is_answered};
use crate::terminal::{TerminalEvent, TerminalProcess};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const TITLE_MAX_CHARS: usize = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Where `input` goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BridgeMode {
    /// Prompts for the AI engine.
    #[default]
    Agent,
    /// Keystrokes for a terminal process.
    Terminal,
}

/// Lifecycle of the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Idle.
    Stopped,
    /// `start` in progress.
    Starting,
    /// Session live.
    Running,
    /// `stop` in progress.
    Ending,
}

/// Notifications published by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// A session went live.
    Started {
        /// The new session.
        session_id: SessionId,
    },
    /// The session ended.
    Stopped {
        /// The ended session.
        session_id: SessionId,
    },
    /// Something worth showing the operator.
    Notification {
        /// Text.
        message: String,
    },
    /// A failure that did not stop the session.
    Error {
        /// Text.
        message: String,
    },
}

/// Orchestrator settings.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Owner of the machine.
    pub user_id: UserId,
    /// Hostname; machines are unique per `(user_id, hostname)`.
    pub hostname: String,
    /// Machine display name.
    pub machine_name: String,
    /// Working directory of the AI session or terminal.
    pub working_directory: PathBuf,
    /// Agent or terminal bridging.
    pub mode: BridgeMode,
    /// Model for new sessions.
    pub model: Option<String>,
    /// Initial permission mode.
    pub permission_mode: PermissionMode,
    /// Transport tunables.
    pub transport: TransportConfig,
    /// Health monitor tunables.
    pub health: HealthConfig,
    /// Program started in terminal mode.
    pub terminal_command: String,
    /// Its arguments.
    pub terminal_args: Vec<String>,
}

impl OrchestratorConfig {
    /// Agent-mode configuration with default tunables.
    pub fn new(user_id: UserId, hostname: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        let hostname = hostname.into();
        Self {
            user_id,
            machine_name: hostname.clone(),
            hostname,
            working_directory: working_directory.into(),
            mode: BridgeMode::Agent,
            model: None,
            permission_mode: PermissionMode::Default,
            transport: TransportConfig::default(),
            health: HealthConfig::default(),
            terminal_command: "bash".to_owned(),
            terminal_args: Vec::new(),
        }
    }
}

/// External collaborators of the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    /// Pub/sub relay.
    pub relay: Arc<dyn Relay>,
    /// Durable storage.
    pub store: Arc<dyn BridgeStore>,
    /// The AI tool's settings document.
    pub settings: Arc<dyn SettingsStore>,
    /// AI completion engine.
    pub engine: Arc<dyn AiEngine>,
    /// Terminal spawner.
    pub terminal: Arc<dyn TerminalProcess>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-session context
// ─────────────────────────────────────────────────────────────────────────────

/// What the worker tasks of one running session share.
struct SessionContext {
    session_id: SessionId,
    transport: Arc<ChannelTransport>,
    store: Arc<dyn BridgeStore>,
    adapter: Arc<AiSessionAdapter>,
    terminal: Arc<dyn TerminalProcess>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl SessionContext {
    async fn emit(&self, body: MessageBody) {
        let kind = body.kind();
        if let Err(error) = self.transport.send(body).await {
            warn!(session_id = %self.session_id, message_type = %kind, %error, "send failed");
        }
    }

    async fn update_session(&self, update: SessionUpdate) {
        if let Err(error) = self.store.update_session(&self.session_id, &update).await {
            warn!(session_id = %self.session_id, %error, "session update not persisted");
        }
    }

    fn notify(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }
}

struct Running {
    context: Arc<SessionContext>,
    monitor: Arc<ConnectionHealthMonitor>,
    dispatcher: Arc<MessageDispatcher>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Runs one bridged session at a time.
pub struct SessionOrchestrator {
    config: OrchestratorConfig,
    collaborators: Collaborators,
    adapter: Arc<AiSessionAdapter>,
    responder: Arc<CommandResponder>,
    state: Mutex<OrchestratorState>,
    running: Mutex<Option<Running>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl SessionOrchestrator {
    /// Idle orchestrator.
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let adapter = Arc::new(AiSessionAdapter::new(
            Arc::clone(&collaborators.engine),
            config.model.clone(),
            config.permission_mode,
        ));
        let responder = Arc::new(CommandResponder::new(
            Arc::clone(&adapter),
            Arc::clone(&collaborators.settings),
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            collaborators,
            adapter,
            responder,
            state: Mutex::new(OrchestratorState::Stopped),
            running: Mutex::new(None),
            events,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }

    /// Live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.context.session_id.clone())
    }

    /// Transport of the live session.
    pub fn transport(&self) -> Option<Arc<ChannelTransport>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.context.transport))
    }

    /// Relay connectivity of the live session.
    pub fn connection_state(&self) -> ConnectionState {
        self.running
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |r| r.monitor.state())
    }

    /// The AI session adapter.
    pub fn adapter(&self) -> &Arc<AiSessionAdapter> {
        &self.adapter
    }

    /// Notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Register the machine, create a session and bridge it.
    ///
    /// Fails with [`BridgeError::AlreadyRunning`] unless stopped.
    #[instrument(skip(self), fields(user_id = %self.config.user_id, hostname = %self.config.hostname))]
    pub async fn start(&self) -> Result<SessionId, BridgeError> {
        {
            let mut state = self.state.lock();
            if *state != OrchestratorState::Stopped {
                return Err(BridgeError::AlreadyRunning);
            }
            *state = OrchestratorState::Starting;
        }

        match self.launch().await {
            Ok(running) => {
                let session_id = running.context.session_id.clone();
                *self.running.lock() = Some(running);
                *self.state.lock() = OrchestratorState::Running;
                info!(%session_id, mode = ?self.config.mode, "session started");
                let _ = self.events.send(OrchestratorEvent::Started {
                    session_id: session_id.clone(),
                });
                Ok(session_id)
            }
            Err(error) => {
                *self.state.lock() = OrchestratorState::Stopped;
                warn!(%error, "session start failed");
                let _ = self.events.send(OrchestratorEvent::Error {
                    message: format!("start failed: {error}"),
                });
                Err(error)
            }
        }
    }

    /// End the session and release its channels. Machine status is left
    /// alone; liveness comes from presence.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock();
            if *state != OrchestratorState::Running {
                return Err(BridgeError::NotRunning);
            }
            *state = OrchestratorState::Ending;
        }

        let running = self.running.lock().take();
        if let Some(running) = running {
            let session_id = running.context.session_id.clone();
            running.monitor.stop();
            running.cancel.cancel();
            for task in running.tasks {
                let _ = task.await;
            }
            running.dispatcher.clear_handlers(None);

            if self.config.mode == BridgeMode::Terminal {
                if let Err(error) = self.collaborators.terminal.kill().await {
                    warn!(%error, "terminal kill failed");
                }
            }
            if let Err(error) = self.collaborators.store.end_session(&session_id).await {
                warn!(%session_id, %error, "session end not persisted");
            }
            if let Err(error) = running.context.transport.disconnect().await {
                warn!(%session_id, %error, "transport disconnect failed");
            }

            info!(%session_id, "session stopped");
            *self.state.lock() = OrchestratorState::Stopped;
            let _ = self.events.send(OrchestratorEvent::Stopped { session_id });
        } else {
            *self.state.lock() = OrchestratorState::Stopped;
        }
        Ok(())
    }

    async fn launch(&self) -> Result<Running, BridgeError> {
        let Collaborators {
            relay,
            store,
            terminal,
            ..
        } = &self.collaborators;

        let machine = store
            .register_machine(&self.config.user_id, &self.config.hostname, &self.config.machine_name)
            .await?;
        debug!(machine_id = %machine.id, status = ?machine.status, "machine registered");

        self.adapter.clear_history();
        let mut session = Session::start(
            machine.id.clone(),
            self.config.working_directory.to_string_lossy(),
        );
        session.model = self.adapter.current_model();
        store.create_session(&session).await?;
        let session_id = session.id.clone();

        let terminal_events = if self.config.mode == BridgeMode::Terminal {
            let spawned = terminal
                .spawn(
                    &self.config.terminal_command,
                    &self.config.terminal_args,
                    &self.config.working_directory,
                )
                .await;
            match spawned {
                Ok(rx) => Some(rx),
                Err(error) => {
                    let _ = store.end_session(&session_id).await;
                    return Err(error.into());
                }
            }
        } else {
            None
        };

        let transport = Arc::new(ChannelTransport::new(
            session_id.clone(),
            Endpoint::Daemon,
            Arc::clone(relay),
            Arc::clone(store),
            self.config.transport.clone(),
        ));
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            Arc::clone(&transport) as Arc<dyn tether_transport::HealthLink>,
            self.config.health.clone(),
        ));
        let health_events = monitor.subscribe();
        let transport_events = transport.subscribe();
        let model_events = self.adapter.subscribe_models();

        monitor.begin_connect();
        transport.connect().await?;
        monitor.start();

        let context = Arc::new(SessionContext {
            session_id,
            transport,
            store: Arc::clone(store),
            adapter: Arc::clone(&self.adapter),
            terminal: Arc::clone(terminal),
            events: self.events.clone(),
        });

        // Dispatcher handlers only enqueue; the workers do the async work.
        let dispatcher = Arc::new(MessageDispatcher::new());
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        for kind in MessageType::ALL.into_iter().filter(|k| is_answered(*k)) {
            let tx = request_tx.clone();
            let _ = dispatcher.register_handler(kind, move |message| {
                let _ = tx.send(message.clone());
            });
        }
        let _ = dispatcher.register_handler(MessageType::Input, move |message| {
            let _ = input_tx.send(message.clone());
        });

        let cancel = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(pump_inbound(
                transport_events,
                Arc::clone(&dispatcher),
                Arc::clone(&monitor),
                Arc::clone(&context),
                cancel.clone(),
            )),
            tokio::spawn(forward_health(health_events, Arc::clone(&context), cancel.clone())),
            tokio::spawn(answer_requests(
                request_rx,
                Arc::clone(&self.responder),
                Arc::clone(&context),
                cancel.clone(),
            )),
            tokio::spawn(forward_models(model_events, Arc::clone(&context), cancel.clone())),
        ];
        match terminal_events {
            Some(rx) => {
                tasks.push(tokio::spawn(pump_terminal(rx, Arc::clone(&context), cancel.clone())));
                tasks.push(tokio::spawn(feed_terminal(input_rx, Arc::clone(&context), cancel.clone())));
            }
            None => {
                tasks.push(tokio::spawn(run_prompts(input_rx, Arc::clone(&context), cancel.clone())));
            }
        }

        context
            .emit(MessageBody::Mode {
                permission_mode: self.adapter.permission_mode(),
            })
            .await;
        if let Some(model) = self.adapter.current_model() {
            context.emit(MessageBody::model(model)).await;
        }

        Ok(Running {
            context,
            monitor,
            dispatcher,
            cancel,
            tasks,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn pump_inbound(
    mut events: broadcast::Receiver<TransportEvent>,
    dispatcher: Arc<MessageDispatcher>,
    monitor: Arc<ConnectionHealthMonitor>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Message(message)) => {
                monitor.on_liveness_signal();
                dispatcher.handle_message(&message);
            }
            Ok(TransportEvent::Degraded { reason }) => {
                context.notify(OrchestratorEvent::Notification {
                    message: format!("relay unavailable, running locally: {reason}"),
                });
            }
            Ok(TransportEvent::Presence(state)) => {
                debug!(participants = state.len(), "session presence changed");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "inbound pump fell behind the transport");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn forward_health(
    mut events: broadcast::Receiver<HealthEvent>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let message = match event {
            Ok(HealthEvent::StateChanged { from, to }) => format!("connection {from} -> {to}"),
            Ok(HealthEvent::Reconnected) => "relay connection restored".to_owned(),
            Ok(HealthEvent::MaxRetriesReached) => {
                "relay unreachable, gave up reconnecting".to_owned()
            }
            Ok(HealthEvent::RetryScheduled { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        context.notify(OrchestratorEvent::Notification { message });
    }
}

async fn answer_requests(
    mut requests: mpsc::UnboundedReceiver<RealtimeMessage>,
    responder: Arc<CommandResponder>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => return,
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        if let Some(reply) = responder.respond(&request).await {
            context.emit(reply).await;
        }
    }
}

/// Announces engine-confirmed models that differ from what was last said.
/// Optimistic announcements are the `model-change` reply itself.
async fn forward_models(
    mut events: broadcast::Receiver<ModelEvent>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    let mut announced = context.adapter.current_model();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let ModelEvent { model, confirmed } = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if announced.as_deref() == Some(model.as_str()) {
            continue;
        }
        if confirmed {
            context.emit(MessageBody::model(model.clone())).await;
        }
        context
            .update_session(SessionUpdate {
                model: Some(model.clone()),
                ..SessionUpdate::default()
            })
            .await;
        announced = Some(model);
    }
}

async fn run_prompts(
    mut inputs: mpsc::UnboundedReceiver<RealtimeMessage>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    let mut titled = false;
    let mut commands_announced = false;
    loop {
        let input = tokio::select! {
            () = cancel.cancelled() => return,
            input = inputs.recv() => match input {
                Some(input) => input,
                None => return,
            },
        };
        let MessageBody::Input {
            content,
            attachments,
        } = input.body
        else {
            continue;
        };

        if !titled {
            titled = true;
            context
                .update_session(SessionUpdate {
                    title: Some(content.chars().take(TITLE_MAX_CHARS).collect()),
                    ..SessionUpdate::default()
                })
                .await;
        }

        let mut stream = match context.adapter.prompt(&content, attachments).await {
            Ok(stream) => stream,
            Err(error) => {
                context.emit(MessageBody::system(format!("Engine error: {error}"))).await;
                context.notify(OrchestratorEvent::Error {
                    message: error.to_string(),
                });
                continue;
            }
        };

        loop {
            // Cancellation is only observed between events; sends settle.
            let item = tokio::select! {
                () = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                None => break,
                Some(Ok(event)) => handle_engine_event(&context, event, &mut commands_announced).await,
                Some(Err(error)) => {
                    warn!(%error, "engine stream failed");
                    context.emit(MessageBody::system(format!("Engine error: {error}"))).await;
                    context.notify(OrchestratorEvent::Error {
                        message: error.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

async fn handle_engine_event(context: &SessionContext, event: EngineEvent, commands_announced: &mut bool) {
    match event {
        EngineEvent::System {
            session_id,
            content,
            ..
        } => {
            if let Some(content) = content {
                context.emit(MessageBody::system(content)).await;
            }
            if let Some(token) = session_id {
                context
                    .update_session(SessionUpdate {
                        resume_token: Some(token),
                        ..SessionUpdate::default()
                    })
                    .await;
            }
        }
        EngineEvent::Assistant { text } => context.emit(MessageBody::output(text)).await,
        EngineEvent::Result {
            is_error: true,
            text,
            ..
        } => context.emit(MessageBody::system(format!("Error: {text}"))).await,
        EngineEvent::Result { session_id, .. } => {
            if !*commands_announced {
                *commands_announced = true;
                context
                    .emit(MessageBody::Commands {
                        commands: context.adapter.commands(),
                    })
                    .await;
            }
            if let Some(token) = session_id {
                context
                    .update_session(SessionUpdate {
                        resume_token: Some(token),
                        ..SessionUpdate::default()
                    })
                    .await;
            }
        }
    }
}

async fn feed_terminal(
    mut inputs: mpsc::UnboundedReceiver<RealtimeMessage>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        let input = tokio::select! {
            () = cancel.cancelled() => return,
            input = inputs.recv() => match input {
                Some(input) => input,
                None => return,
            },
        };
        let Some(content) = input.content() else {
            continue;
        };
        let line = format!("{content}\n");
        if let Err(error) = context.terminal.write(line.as_bytes()).await {
            warn!(%error, "terminal write failed");
            context.emit(MessageBody::system(format!("Terminal error: {error}"))).await;
        }
    }
}

async fn pump_terminal(
    mut output: mpsc::Receiver<TerminalEvent>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = output.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            TerminalEvent::Output(bytes) => {
                context
                    .emit(MessageBody::output(String::from_utf8_lossy(&bytes).into_owned()))
                    .await;
            }
            TerminalEvent::Exited { code } => {
                let message = match code {
                    Some(code) => format!("Process exited with code {code}"),
                    None => "Process terminated".to_owned(),
                };
                context.emit(MessageBody::system(message.clone())).await;
                context.notify(OrchestratorEvent::Notification { message });
                return;
            }
        }
    }
}
