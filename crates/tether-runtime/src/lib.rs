//! # tether-runtime
//!
//! The daemon side of a bridged session.
//!
//! - **[`engine`]** / **[`terminal`]**: collaborator interfaces with
//!   process-backed implementations
//! - **[`adapter`]**: resume token, conversation history and model state
//!   around the engine
//! - **[`protocol`]**: one reply per inbound request
//! - **[`orchestrator`]**: session lifecycle and message routing
//! - **[`testing`]**: scripted collaborators for tests

#![deny(unsafe_code)]

pub mod adapter;
pub mod engine;
pub mod errors;
pub mod orchestrator;
pub mod protocol;
pub mod terminal;
pub mod testing;

pub use adapter::{AiSessionAdapter, ModelEvent, ModelState};
pub use engine::{AiEngine, EngineEvent, EngineEventStream, ProcessEngine, PromptRequest};
pub use errors::EngineError;
pub use orchestrator::{
    BridgeMode, Collaborators, OrchestratorConfig, OrchestratorEvent, OrchestratorState,
    SessionOrchestrator,
};
pub use protocol::CommandResponder;
pub use terminal::{ProcessTerminal, TerminalEvent, TerminalProcess};
