//! The storage collaborator interface.

use async_trait::async_trait;

use tether_core::ids::{MachineId, SessionId, UserId};
use tether_core::messages::MessageType;
use tether_core::models::{Machine, MachineStatus, Session, SessionUpdate, StoredMessage};

use crate::errors::Result;

/// Plain CRUD over machines, sessions and message history.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    /// Register the machine `hostname` for `user_id`.
    ///
    /// Idempotent by `(user_id, hostname)`: an existing record is returned
    /// with its status flipped to online instead of creating a duplicate.
    async fn register_machine(&self, user_id: &UserId, hostname: &str, name: &str)
    -> Result<Machine>;

    /// Set a machine's status and stamp `last_seen`.
    async fn set_machine_status(&self, machine_id: &MachineId, status: MachineStatus)
    -> Result<()>;

    /// Look up a machine.
    async fn get_machine(&self, machine_id: &MachineId) -> Result<Option<Machine>>;

    /// Insert a new session record.
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Apply a partial update to a session.
    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()>;

    /// Mark a session ended and stamp `ended_at`. Returns the updated record.
    async fn end_session(&self, session_id: &SessionId) -> Result<Session>;

    /// Look up a session.
    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>>;

    /// Append a history row. A row whose `(seq, type)` already exists for the
    /// session is ignored.
    async fn append_message(&self, message: &StoredMessage) -> Result<()>;

    /// History rows of a session in `created_at` order, optionally only those
    /// with `seq > after_seq`.
    async fn list_messages(
        &self,
        session_id: &SessionId,
        after_seq: Option<u64>,
    ) -> Result<Vec<StoredMessage>>;

    /// Highest persisted `seq` among rows of the given types.
    async fn last_seq(&self, session_id: &SessionId, types: &[MessageType]) -> Result<Option<u64>>;

    /// Raise the recorded high-water seq of `sender` in a session. Never
    /// lowers it.
    async fn mark_seq(&self, session_id: &SessionId, sender: &str, seq: u64) -> Result<()>;

    /// High-water seq recorded for `sender`, if any.
    async fn seq_mark(&self, session_id: &SessionId, sender: &str) -> Result<Option<u64>>;
}
