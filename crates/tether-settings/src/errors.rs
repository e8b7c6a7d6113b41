//! Settings error types.

use tether_core::BridgeError;
use thiserror::Error;

/// Errors that can occur when loading, storing or editing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read or write a settings file.
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse or encode settings JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (wrong type, not one of the choices).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
    /// No interactive form exists for the command.
    #[error("unsupported interactive command: {0}")]
    UnknownCommand(String),
    /// The form has no option with the given key.
    #[error("unknown option '{key}' for /{command}")]
    UnknownOption {
        /// Form command.
        command: String,
        /// Offending key.
        key: String,
    },
    /// The settings document is not a JSON object; it is left as is.
    #[error("settings document is not a JSON object (found {0})")]
    NotAnObject(&'static str),
    /// A blocking settings task panicked or was cancelled.
    #[error("settings task failed: {0}")]
    Task(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

impl From<SettingsError> for BridgeError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e.to_string())
    }
}
