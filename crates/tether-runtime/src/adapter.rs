//! AI Session Adapter.
//!
//! Wraps an [`AiEngine`] with the state the bridge reconciles across
//! reconnects and model switches:
//!
//! - the resumable engine session token, captured from the first response
//!   and passed back as a resume hint until cleared;
//! - the conversation history (one user turn per prompt, one assistant turn
//!   per completed response);
//! - the model, kept as `{current, pending}`. A model switch is announced
//!   optimistically and reconciled when the engine reports the model it is
//!   actually running.
//!
//! After a switch the next prompt starts a fresh engine session seeded with
//! the accumulated history instead of resuming.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use tether_core::messages::{Attachment, CommandInfo, ModelInfo, PermissionMode};
use tether_core::models::ConversationTurn;

use crate::engine::{AiEngine, EngineEvent, EngineEventStream, PromptRequest, fallback_models};
use crate::errors::Result;

/// Commands announced before the engine has reported its own list.
const FALLBACK_COMMANDS: [&str; 8] = [
    "clear", "compact", "config", "cost", "help", "model", "theme", "vim",
];

/// Model selection state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelState {
    /// Model the engine last confirmed (or the configured default).
    pub current: Option<String>,
    /// Model requested but not yet confirmed by the engine.
    pub pending: Option<String>,
}

impl ModelState {
    /// The model the next prompt will ask for.
    pub fn effective(&self) -> Option<&str> {
        self.pending.as_deref().or(self.current.as_deref())
    }
}

/// Announcement of a model change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelEvent {
    /// Model id.
    pub model: String,
    /// `false` for the optimistic announcement, `true` once the engine has
    /// reported the model it is running.
    pub confirmed: bool,
}

#[derive(Default)]
struct AdapterState {
    resume_token: Option<String>,
    history: Vec<ConversationTurn>,
    model: ModelState,
    needs_seed: bool,
    permission_mode: PermissionMode,
    reported_commands: Vec<String>,
    reported_models: Option<Vec<ModelInfo>>,
    completed_turns: u64,
    /// Bumped by every model switch. A turn submitted under an older value
    /// belongs to the abandoned engine session.
    model_generation: u64,
}

impl AdapterState {
    fn apply(&mut self, event: &EngineEvent, generation: u64, models: &broadcast::Sender<ModelEvent>) {
        let stale = generation < self.model_generation;
        match event {
            EngineEvent::System {
                session_id,
                model,
                commands,
                ..
            } => {
                if !commands.is_empty() {
                    self.reported_commands.clone_from(commands);
                }
                if stale {
                    debug!(reported = ?model, "ignoring session report of a turn started before the model switch");
                    return;
                }
                if let Some(token) = session_id {
                    self.resume_token = Some(token.clone());
                }
                if let Some(reported) = model {
                    self.reconcile_model(reported, models);
                }
            }
            EngineEvent::Assistant { .. } => {}
            EngineEvent::Result {
                session_id,
                text,
                is_error,
            } => {
                if let Some(token) = session_id.as_ref().filter(|_| !stale) {
                    self.resume_token = Some(token.clone());
                }
                if !is_error {
                    self.history.push(ConversationTurn::assistant(text.clone()));
                    self.completed_turns += 1;
                }
            }
        }
    }

    fn reconcile_model(&mut self, reported: &str, models: &broadcast::Sender<ModelEvent>) {
        let Some(pending) = self.model.pending.take() else {
            if self.model.current.is_none() {
                self.model.current = Some(reported.to_owned());
            }
            return;
        };
        // Engines report full ids for aliases ("sonnet" -> "claude-sonnet-4-...").
        let confirmed = if reported == pending || reported.contains(pending.as_str()) {
            pending
        } else {
            info!(requested = %pending, reported, "engine overrode requested model");
            reported.to_owned()
        };
        self.model.current = Some(confirmed.clone());
        let _ = models.send(ModelEvent {
            model: confirmed,
            confirmed: true,
        });
    }
}

/// Stateful wrapper around the AI engine.
pub struct AiSessionAdapter {
    engine: Arc<dyn AiEngine>,
    state: Arc<Mutex<AdapterState>>,
    model_tx: broadcast::Sender<ModelEvent>,
}

impl AiSessionAdapter {
    /// Adapter over `engine` starting with `initial_model`.
    pub fn new(
        engine: Arc<dyn AiEngine>,
        initial_model: Option<String>,
        permission_mode: PermissionMode,
    ) -> Self {
        let (model_tx, _) = broadcast::channel(16);
        let state = AdapterState {
            model: ModelState {
                current: initial_model,
                pending: None,
            },
            permission_mode,
            ..AdapterState::default()
        };
        Self {
            engine,
            state: Arc::new(Mutex::new(state)),
            model_tx,
        }
    }

    /// Model announcements.
    pub fn subscribe_models(&self) -> broadcast::Receiver<ModelEvent> {
        self.model_tx.subscribe()
    }

    /// Submit a prompt. The returned stream updates the adapter as events
    /// pass through it, so it must be drained for history to advance.
    ///
    /// A model switch made while the turn is in flight wins: the turn's
    /// reported model and session token are not applied.
    #[instrument(skip_all, fields(len = text.len(), attachments = attachments.len()))]
    pub async fn prompt(&self, text: &str, attachments: Vec<Attachment>) -> Result<EngineEventStream> {
        let (request, generation) = {
            let mut state = self.state.lock();
            let seed_context = if state.needs_seed {
                state.needs_seed = false;
                state.history.clone()
            } else {
                Vec::new()
            };
            state.history.push(ConversationTurn::user(text));
            let request = PromptRequest {
                text: text.to_owned(),
                attachments,
                resume: if seed_context.is_empty() {
                    state.resume_token.clone()
                } else {
                    None
                },
                model: state.model.effective().map(str::to_owned),
                seed_context,
                permission_mode: state.permission_mode,
            };
            (request, state.model_generation)
        };
        debug!(
            resume = request.resume.is_some(),
            seeded = request.seed_context.len(),
            model = ?request.model,
            "submitting prompt"
        );

        let mut inner = self.engine.send_prompt(request).await?;
        let state = Arc::clone(&self.state);
        let models = self.model_tx.clone();
        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = inner.next().await {
                if let Ok(event) = &item {
                    state.lock().apply(event, generation, &models);
                }
                yield item;
            }
        }))
    }

    /// Switch model. Drops the resume token so the next prompt starts a fresh
    /// engine session seeded with the history, and announces the switch
    /// optimistically.
    #[instrument(skip(self))]
    pub async fn set_model(&self, model: &str) -> Result<ModelEvent> {
        self.engine.set_model(model).await?;
        {
            let mut state = self.state.lock();
            state.resume_token = None;
            state.needs_seed = !state.history.is_empty();
            state.model.pending = Some(model.to_owned());
            state.model_generation += 1;
        }
        let event = ModelEvent {
            model: model.to_owned(),
            confirmed: false,
        };
        let _ = self.model_tx.send(event.clone());
        info!(model, "model switch requested");
        Ok(event)
    }

    /// Forget the conversation and the engine session.
    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.resume_token = None;
        state.needs_seed = false;
        state.completed_turns = 0;
        state.reported_commands.clear();
    }

    /// Conversation so far.
    pub fn history(&self) -> Vec<ConversationTurn> {
        self.state.lock().history.clone()
    }

    /// Current resume token.
    pub fn resume_token(&self) -> Option<String> {
        self.state.lock().resume_token.clone()
    }

    /// Model selection state.
    pub fn model_state(&self) -> ModelState {
        self.state.lock().model.clone()
    }

    /// The model the next prompt will use, if known.
    pub fn current_model(&self) -> Option<String> {
        self.state.lock().model.effective().map(str::to_owned)
    }

    /// Number of completed engine turns.
    pub fn completed_turns(&self) -> u64 {
        self.state.lock().completed_turns
    }

    /// Model catalog: the static fallback until an engine session exists,
    /// then whatever the engine reports.
    pub async fn supported_models(&self) -> Vec<ModelInfo> {
        let has_session = {
            let state = self.state.lock();
            if let Some(models) = &state.reported_models {
                return models.clone();
            }
            state.resume_token.is_some() || state.completed_turns > 0
        };
        if !has_session {
            return fallback_models();
        }
        match self.engine.list_models().await {
            Ok(models) if !models.is_empty() => {
                self.state.lock().reported_models = Some(models.clone());
                models
            }
            Ok(_) => fallback_models(),
            Err(error) => {
                debug!(%error, "engine model list unavailable");
                fallback_models()
            }
        }
    }

    /// Permission mode for subsequent prompts.
    pub fn set_permission_mode(&self, mode: PermissionMode) {
        self.state.lock().permission_mode = mode;
    }

    /// Current permission mode.
    pub fn permission_mode(&self) -> PermissionMode {
        self.state.lock().permission_mode
    }

    /// Supported commands; the engine's list once it has reported one.
    pub fn commands(&self) -> Vec<CommandInfo> {
        let state = self.state.lock();
        if state.reported_commands.is_empty() {
            FALLBACK_COMMANDS.iter().map(|c| CommandInfo::named(*c)).collect()
        } else {
            state.reported_commands.iter().map(CommandInfo::named).collect()
        }
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use futures::StreamExt;

    fn system(session: &str, model: &str) -> EngineEvent {
        EngineEvent::System {
            session_id: Some(session.into()),
            model: Some(model.into()),
            commands: vec!["clear".into(), "review".into()],
            content: None,
        }
    }

    fn result(session: &str, text: &str) -> EngineEvent {
        EngineEvent::Result {
            session_id: Some(session.into()),
            text: text.into(),
            is_error: false,
        }
    }

    async fn drain(adapter: &AiSessionAdapter, text: &str) -> Vec<EngineEvent> {
        adapter
            .prompt(text, Vec::new())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn captures_resume_token_and_history() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![system("tok-1", "claude-sonnet-4"), result("tok-1", "hi there")]);
        engine.push_turn(vec![result("tok-1", "again")]);
        let adapter = AiSessionAdapter::new(engine.clone(), Some("sonnet".into()), PermissionMode::Default);

        drain(&adapter, "hello").await;
        assert_eq!(adapter.resume_token().as_deref(), Some("tok-1"));
        drain(&adapter, "more").await;

        let requests = engine.requests();
        assert_eq!(requests[0].resume, None);
        assert_eq!(requests[1].resume.as_deref(), Some("tok-1"));
        assert_eq!(
            adapter.history(),
            vec![
                ConversationTurn::user("hello"),
                ConversationTurn::assistant("hi there"),
                ConversationTurn::user("more"),
                ConversationTurn::assistant("again"),
            ]
        );
        assert_eq!(adapter.completed_turns(), 2);
    }

    #[tokio::test]
    async fn model_switch_drops_resume_and_seeds_history_once() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![system("tok-1", "claude-sonnet-4"), result("tok-1", "first")]);
        engine.push_turn(vec![system("tok-2", "claude-opus-4"), result("tok-2", "second")]);
        engine.push_turn(vec![result("tok-2", "third")]);
        let adapter = AiSessionAdapter::new(engine.clone(), None, PermissionMode::Default);
        let mut models = adapter.subscribe_models();

        drain(&adapter, "one").await;
        let announced = adapter.set_model("opus").await.unwrap();
        assert!(!announced.confirmed);
        assert_eq!(adapter.resume_token(), None);
        assert_eq!(adapter.model_state().pending.as_deref(), Some("opus"));

        drain(&adapter, "two").await;
        drain(&adapter, "three").await;

        let requests = engine.requests();
        assert_eq!(requests[1].resume, None);
        assert_eq!(requests[1].model.as_deref(), Some("opus"));
        assert_eq!(requests[1].seed_context.len(), 2);
        assert_eq!(requests[2].resume.as_deref(), Some("tok-2"));
        assert!(requests[2].seed_context.is_empty());
        assert_eq!(engine.model().as_deref(), Some("opus"));

        assert_eq!(models.recv().await.unwrap(), ModelEvent { model: "opus".into(), confirmed: false });
        assert_eq!(models.recv().await.unwrap(), ModelEvent { model: "opus".into(), confirmed: true });
        assert_eq!(adapter.model_state(), ModelState { current: Some("opus".into()), pending: None });
    }

    #[tokio::test]
    async fn engine_reported_model_wins_over_pending() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![system("tok", "claude-haiku-3"), result("tok", "ok")]);
        let adapter = AiSessionAdapter::new(engine, Some("sonnet".into()), PermissionMode::Default);
        adapter.set_model("opus").await.unwrap();
        drain(&adapter, "go").await;
        assert_eq!(adapter.current_model().as_deref(), Some("claude-haiku-3"));
    }

    #[tokio::test]
    async fn model_switch_before_any_turn_does_not_seed() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![result("tok", "ok")]);
        let adapter = AiSessionAdapter::new(engine.clone(), None, PermissionMode::Default);
        adapter.set_model("haiku").await.unwrap();
        drain(&adapter, "go").await;
        assert!(engine.requests()[0].seed_context.is_empty());
    }

    #[tokio::test]
    async fn clear_history_starts_over() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![result("tok", "ok")]);
        engine.push_turn(vec![result("tok-b", "ok")]);
        let adapter = AiSessionAdapter::new(engine.clone(), None, PermissionMode::Default);
        drain(&adapter, "a").await;
        adapter.clear_history();
        assert!(adapter.history().is_empty());
        assert_eq!(adapter.resume_token(), None);
        drain(&adapter, "b").await;
        assert_eq!(engine.requests()[1].resume, None);
        assert!(engine.requests()[1].seed_context.is_empty());
    }

    #[tokio::test]
    async fn failed_turn_is_not_recorded_as_assistant_text() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![EngineEvent::Result {
            session_id: None,
            text: "rate limited".into(),
            is_error: true,
        }]);
        let adapter = AiSessionAdapter::new(engine, None, PermissionMode::Default);
        drain(&adapter, "a").await;
        assert_eq!(adapter.history(), vec![ConversationTurn::user("a")]);
        assert_eq!(adapter.completed_turns(), 0);
    }

    #[tokio::test]
    async fn catalogs_fall_back_until_the_engine_reports() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_models(vec![ModelInfo {
            id: "custom".into(),
            name: "Custom".into(),
            description: None,
        }]);
        engine.push_turn(vec![system("tok", "custom"), result("tok", "ok")]);
        let adapter = AiSessionAdapter::new(engine, None, PermissionMode::Plan);

        assert_eq!(adapter.supported_models().await, fallback_models());
        assert!(adapter.commands().iter().any(|c| c.name == "vim"));

        drain(&adapter, "a").await;
        let models = adapter.supported_models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "custom");
        let names: Vec<_> = adapter.commands().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["clear", "review"]);
    }

    #[tokio::test]
    async fn permission_mode_flows_into_requests() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![result("tok", "ok")]);
        let adapter = AiSessionAdapter::new(engine.clone(), None, PermissionMode::Default);
        adapter.set_permission_mode(PermissionMode::AcceptEdits);
        assert_eq!(adapter.permission_mode(), PermissionMode::AcceptEdits);
        drain(&adapter, "a").await;
        assert_eq!(engine.requests()[0].permission_mode, PermissionMode::AcceptEdits);
    }

    #[tokio::test]
    async fn switch_during_in_flight_turn_is_not_undone() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_turn(vec![system("tok-1", "claude-sonnet-4"), result("tok-1", "first")]);
        engine.push_turn(vec![system("tok-2", "claude-opus-4"), result("tok-2", "second")]);
        let adapter = AiSessionAdapter::new(engine.clone(), Some("sonnet".into()), PermissionMode::Default);
        let mut models = adapter.subscribe_models();

        let in_flight = adapter.prompt("a", Vec::new()).await.unwrap();
        adapter.set_model("opus").await.unwrap();
        let _: Vec<_> = in_flight.collect().await;

        assert_eq!(adapter.current_model().as_deref(), Some("opus"));
        assert_eq!(adapter.model_state().pending.as_deref(), Some("opus"));
        assert_eq!(adapter.resume_token(), None);
        assert_eq!(adapter.history().len(), 2);

        drain(&adapter, "b").await;
        let requests = engine.requests();
        assert_eq!(requests[1].model.as_deref(), Some("opus"));
        assert_eq!(requests[1].resume, None);
        assert_eq!(requests[1].seed_context.len(), 2);
        assert_eq!(adapter.model_state(), ModelState { current: Some("opus".into()), pending: None });
        assert_eq!(adapter.resume_token().as_deref(), Some("tok-2"));

        assert_eq!(models.recv().await.unwrap(), ModelEvent { model: "opus".into(), confirmed: false });
        assert_eq!(models.recv().await.unwrap(), ModelEvent { model: "opus".into(), confirmed: true });
    }
}
