//! In-process stand-ins for the engine and terminal collaborators.
//!
//! Used by this crate's tests and by downstream integration tests.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tether_core::messages::ModelInfo;

use crate::engine::{AiEngine, EngineEvent, EngineEventStream, PromptRequest, fallback_models};
use crate::errors::{EngineError, Result};
use crate::terminal::{TerminalEvent, TerminalProcess};

/// Engine that replays scripted turns and records every request.
///
/// A prompt with no scripted turn left answers with a single successful
/// `Result` echoing the prompt text.
#[derive(Default)]
pub struct ScriptedEngine {
    turns: Mutex<VecDeque<Vec<Result<EngineEvent>>>>,
    requests: Mutex<Vec<PromptRequest>>,
    model: Mutex<Option<String>>,
    models: Mutex<Option<Vec<ModelInfo>>>,
    refuse_switch: Mutex<bool>,
}

impl ScriptedEngine {
    /// Engine with no scripted turns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the events for the next prompt.
    pub fn push_turn(&self, events: Vec<EngineEvent>) {
        self.turns.lock().push_back(events.into_iter().map(Ok).collect());
    }

    /// Queue a turn whose stream fails after `events`.
    pub fn push_failing_turn(&self, events: Vec<EngineEvent>, error: EngineError) {
        let mut turn: Vec<_> = events.into_iter().map(Ok).collect();
        turn.push(Err(error));
        self.turns.lock().push_back(turn);
    }

    /// Catalog returned by `list_models`.
    pub fn set_models(&self, models: Vec<ModelInfo>) {
        *self.models.lock() = Some(models);
    }

    /// Make `set_model` fail.
    pub fn refuse_model_switch(&self, refuse: bool) {
        *self.refuse_switch.lock() = refuse;
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<PromptRequest> {
        self.requests.lock().clone()
    }

    /// Model last passed to `set_model`.
    pub fn model(&self) -> Option<String> {
        self.model.lock().clone()
    }
}

#[async_trait]
impl AiEngine for ScriptedEngine {
    async fn send_prompt(&self, request: PromptRequest) -> Result<EngineEventStream> {
        let turn = self.turns.lock().pop_front().unwrap_or_else(|| {
            vec![Ok(EngineEvent::Result {
                session_id: None,
                text: request.text.clone(),
                is_error: false,
            })]
        });
        self.requests.lock().push(request);
        Ok(Box::pin(futures::stream::iter(turn)))
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        if *self.refuse_switch.lock() {
            return Err(EngineError::Unavailable(format!("model {model} not offered")));
        }
        *self.model.lock() = Some(model.to_owned());
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.models.lock().clone().unwrap_or_else(fallback_models))
    }
}

/// Terminal that records writes and lets tests push output.
#[derive(Default)]
pub struct FakeTerminal {
    events: Mutex<Option<mpsc::Sender<TerminalEvent>>>,
    written: Mutex<Vec<u8>>,
    spawned: Mutex<Vec<String>>,
}

impl FakeTerminal {
    /// Idle fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit output as if the process wrote it.
    pub async fn emit(&self, event: TerminalEvent) {
        let tx = self.events.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Everything written so far, lossily decoded.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    /// Commands spawned so far.
    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().clone()
    }

    /// Whether a process is attached.
    pub fn is_running(&self) -> bool {
        self.events.lock().is_some()
    }
}

#[async_trait]
impl TerminalProcess for FakeTerminal {
    async fn spawn(
        &self,
        command: &str,
        _args: &[String],
        _cwd: &Path,
    ) -> Result<mpsc::Receiver<TerminalEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock() = Some(tx);
        self.spawned.lock().push(command.to_owned());
        Ok(rx)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.events.lock().is_none() {
            return Err(EngineError::Unavailable("terminal not running".into()));
        }
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let tx = self.events.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(TerminalEvent::Exited { code: None }).await;
        }
        Ok(())
    }
}
