//! Errors of the AI engine and terminal collaborators.

use thiserror::Error;

use tether_core::errors::BridgeError;

/// Engine / terminal failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The process could not be started.
    #[error("failed to spawn {command}: {message}")]
    Spawn {
        /// Executable.
        command: String,
        /// OS error.
        message: String,
    },

    /// Reading or writing the process failed.
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine produced output that could not be understood.
    #[error("engine protocol error: {0}")]
    Protocol(String),

    /// The process exited unsuccessfully.
    #[error("engine exited with {code:?}: {stderr}")]
    Exited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Tail of stderr.
        stderr: String,
    },

    /// The collaborator is not running or does not support the call.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for BridgeError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, EngineError>;
