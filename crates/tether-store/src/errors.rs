//! Error types for the storage collaborator.

use tether_core::BridgeError;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Requested machine was not found.
    #[error("machine not found: {0}")]
    MachineNotFound(String),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Storage is unavailable (blocking task failed, injected fault).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_display() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn migration_error_display() {
        let err = StoreError::Migration {
            message: "v1 failed".into(),
        };
        assert_eq!(err.to_string(), "migration error: v1 failed");
    }

    #[test]
    fn maps_to_persistence_category() {
        let err: BridgeError = StoreError::SessionNotFound("s".into()).into();
        assert_eq!(err.category(), tether_core::ErrorCategory::Persistence);
    }
}
