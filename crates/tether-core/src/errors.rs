//! Cross-crate error type and the bridge's failure taxonomy.

use thiserror::Error;

/// How a failure is recovered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Relay unreachable. The bridge continues in local-only mode.
    TransportDegraded,
    /// No liveness signal within budget. The reconnect loop takes over.
    Timeout,
    /// Unknown or malformed message. Ignored or answered with a failure result.
    Protocol,
    /// Caller error. Surfaces to the caller, never retried.
    Misuse,
    /// Durable storage failed. Logged and swallowed on the realtime path.
    Persistence,
    /// AI engine or terminal collaborator failed.
    Engine,
    /// Anything else.
    Internal,
}

/// Errors surfaced by bridge components.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// `send` (or another channel operation) before `connect`.
    #[error("transport is not connected")]
    NotConnected,

    /// `start` on an orchestrator that is starting or running.
    #[error("session bridge is already running")]
    AlreadyRunning,

    /// Operation that needs a running orchestrator.
    #[error("session bridge is not running")]
    NotRunning,

    /// Relay could not be reached or rejected an operation.
    #[error("relay unavailable: {0}")]
    Relay(String),

    /// An operation did not complete within its budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed or unsupported message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Durable storage failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// AI engine / terminal failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// Settings could not be read or written.
    #[error("settings error: {0}")]
    Settings(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Recovery category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConnected | Self::AlreadyRunning | Self::NotRunning => ErrorCategory::Misuse,
            Self::Relay(_) => ErrorCategory::TransportDegraded,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Persistence(_) => ErrorCategory::Persistence,
            Self::Engine(_) => ErrorCategory::Engine,
            Self::Settings(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this error is a programmer error that must reach the caller.
    pub fn is_misuse(&self) -> bool {
        self.category() == ErrorCategory::Misuse
    }

    /// Short machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::Relay(_) => "relay",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Persistence(_) => "persistence",
            Self::Engine(_) => "engine",
            Self::Settings(_) => "settings",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BridgeError>;
