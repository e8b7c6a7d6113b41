//! In-memory [`BridgeStore`] for tests and local-only runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use tether_core::ids::{MachineId, SessionId, UserId};
use tether_core::messages::MessageType;
use tether_core::models::{
    Machine, MachineStatus, Session, SessionStatus, SessionUpdate, StoredMessage,
};

use crate::errors::{Result, StoreError};
use crate::store::BridgeStore;

#[derive(Default)]
struct Tables {
    machines: HashMap<MachineId, Machine>,
    sessions: HashMap<SessionId, Session>,
    messages: Vec<StoredMessage>,
    seq_marks: HashMap<(SessionId, String), u64>,
}

/// Store holding everything in process memory.
///
/// `set_fail_writes(true)` makes every mutating call fail, to exercise
/// best-effort persistence paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle write-failure injection.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of machine records.
    pub fn machine_count(&self) -> usize {
        self.tables.lock().machines.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeStore for MemoryStore {
    async fn register_machine(&self, user_id: &UserId, hostname: &str, name: &str) -> Result<Machine> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .machines
            .values_mut()
            .find(|m| &m.user_id == user_id && m.hostname == hostname)
        {
            existing.status = MachineStatus::Online;
            existing.last_seen = Utc::now();
            name.clone_into(&mut existing.name);
            return Ok(existing.clone());
        }
        let machine = Machine {
            id: MachineId::new(),
            user_id: user_id.clone(),
            name: name.to_owned(),
            hostname: hostname.to_owned(),
            status: MachineStatus::Online,
            last_seen: Utc::now(),
        };
        let _ = tables.machines.insert(machine.id.clone(), machine.clone());
        Ok(machine)
    }

    async fn set_machine_status(&self, machine_id: &MachineId, status: MachineStatus) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let machine = tables
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| StoreError::MachineNotFound(machine_id.to_string()))?;
        machine.status = status;
        machine.last_seen = Utc::now();
        Ok(())
    }

    async fn get_machine(&self, machine_id: &MachineId) -> Result<Option<Machine>> {
        Ok(self.tables.lock().machines.get(machine_id).cloned())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.check_writable()?;
        let _ = self
            .tables
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        if let Some(title) = &update.title {
            session.title = Some(title.clone());
        }
        if let Some(model) = &update.model {
            session.model = Some(model.clone());
        }
        if let Some(token) = &update.resume_token {
            session.resume_token = Some(token.clone());
        }
        Ok(())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<Session> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        session.status = SessionStatus::Ended;
        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
        }
        Ok(session.clone())
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        Ok(self.tables.lock().sessions.get(session_id).cloned())
    }

    async fn append_message(&self, message: &StoredMessage) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let duplicate = tables.messages.iter().any(|m| {
            m.session_id == message.session_id && m.kind == message.kind && m.seq == message.seq
        });
        if !duplicate {
            tables.messages.push(message.clone());
        }
        Ok(())
    }

    async fn list_messages(&self, session_id: &SessionId, after_seq: Option<u64>) -> Result<Vec<StoredMessage>> {
        let tables = self.tables.lock();
        let mut rows: Vec<StoredMessage> = tables
            .messages
            .iter()
            .filter(|m| &m.session_id == session_id)
            .filter(|m| after_seq.is_none_or(|after| m.seq > after))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn last_seq(&self, session_id: &SessionId, types: &[MessageType]) -> Result<Option<u64>> {
        Ok(self
            .tables
            .lock()
            .messages
            .iter()
            .filter(|m| &m.session_id == session_id && types.contains(&m.kind))
            .map(|m| m.seq)
            .max())
    }

    async fn mark_seq(&self, session_id: &SessionId, sender: &str, seq: u64) -> Result<()> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        let mark = tables
            .seq_marks
            .entry((session_id.clone(), sender.to_owned()))
            .or_default();
        *mark = (*mark).max(seq);
        Ok(())
    }

    async fn seq_mark(&self, session_id: &SessionId, sender: &str) -> Result<Option<u64>> {
        Ok(self
            .tables
            .lock()
            .seq_marks
            .get(&(session_id.clone(), sender.to_owned()))
            .copied())
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn register_machine_is_idempotent_by_hostname() {
        let store = MemoryStore::new();
        let user = UserId::from("u1");
        let first = store.register_machine(&user, "box1", "Box").await.unwrap();
        store
            .set_machine_status(&first.id, MachineStatus::Offline)
            .await
            .unwrap();

        let again = store.register_machine(&user, "box1", "Box").await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, MachineStatus::Online);
        assert_eq!(store.machine_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_block_writes_only() {
        let store = MemoryStore::new();
        let sid = SessionId::from("s");
        store.set_fail_writes(true);
        let row = StoredMessage {
            session_id: sid.clone(),
            kind: MessageType::Output,
            content: "x".into(),
            seq: 1,
            created_at: Utc::now(),
        };
        assert_matches!(store.append_message(&row).await, Err(StoreError::Unavailable(_)));
        assert!(store.list_messages(&sid, None).await.unwrap().is_empty());
        store.set_fail_writes(false);
        store.append_message(&row).await.unwrap();
        store.append_message(&row).await.unwrap();
        assert_eq!(store.list_messages(&sid, None).await.unwrap().len(), 1);
        assert_eq!(
            store.last_seq(&sid, &[MessageType::Output]).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let store = MemoryStore::new();
        let session = Session::start(MachineId::from("m"), "/w");
        store.create_session(&session).await.unwrap();
        store
            .update_session(
                &session.id,
                &SessionUpdate {
                    title: Some("Fix bug".into()),
                    ..SessionUpdate::default()
                },
            )
            .await
            .unwrap();
        let ended = store.end_session(&session.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.title.as_deref(), Some("Fix bug"));
        assert!(ended.ended_at.is_some());
    }
}
