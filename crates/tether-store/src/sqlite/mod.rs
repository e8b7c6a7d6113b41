//! `SQLite` backend.
//!
//! - **[`connection`]**: `r2d2` pool with WAL mode and foreign keys on every
//!   connection.
//! - **[`migrations`]**: embedded, version-tracked schema.
//! - **[`repositories`]**: stateless repositories taking `&Connection`.
//!
//! [`SqliteStore`] runs every repository call on the blocking pool.

pub mod connection;
pub mod migrations;
pub mod repositories;

use std::path::Path;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::task;

use tether_core::ids::{MachineId, SessionId, UserId};
use tether_core::messages::MessageType;
use tether_core::models::{Machine, MachineStatus, Session, SessionUpdate, StoredMessage};

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection};
use repositories::{MachineRepo, MessageRepo, SessionRepo};

use crate::errors::{Result, StoreError};
use crate::store::BridgeStore;

/// [`BridgeStore`] backed by a pooled `SQLite` database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    /// Open (and migrate) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_pool(connection::new_file(path, &ConnectionConfig::default())?)
    }

    /// Open a migrated in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    /// Wrap an existing pool, running pending migrations.
    pub fn from_pool(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = migrations::run_migrations(&conn)?;
        }
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl BridgeStore for SqliteStore {
    async fn register_machine(&self, user_id: &UserId, hostname: &str, name: &str) -> Result<Machine> {
        let (user_id, hostname, name) = (user_id.clone(), hostname.to_owned(), name.to_owned());
        self.with_conn(move |conn| MachineRepo::register(conn, &user_id, &hostname, &name))
            .await
    }

    async fn set_machine_status(&self, machine_id: &MachineId, status: MachineStatus) -> Result<()> {
        let machine_id = machine_id.clone();
        self.with_conn(move |conn| MachineRepo::set_status(conn, &machine_id, status))
            .await
    }

    async fn get_machine(&self, machine_id: &MachineId) -> Result<Option<Machine>> {
        let machine_id = machine_id.clone();
        self.with_conn(move |conn| MachineRepo::get(conn, &machine_id)).await
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| SessionRepo::create(conn, &session)).await
    }

    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()> {
        let (session_id, update) = (session_id.clone(), update.clone());
        self.with_conn(move |conn| SessionRepo::update(conn, &session_id, &update))
            .await
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<Session> {
        let session_id = session_id.clone();
        self.with_conn(move |conn| SessionRepo::end(conn, &session_id)).await
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let session_id = session_id.clone();
        self.with_conn(move |conn| SessionRepo::get(conn, &session_id)).await
    }

    async fn append_message(&self, message: &StoredMessage) -> Result<()> {
        let message = message.clone();
        self.with_conn(move |conn| MessageRepo::append(conn, &message).map(|_| ()))
            .await
    }

    async fn list_messages(&self, session_id: &SessionId, after_seq: Option<u64>) -> Result<Vec<StoredMessage>> {
        let session_id = session_id.clone();
        self.with_conn(move |conn| MessageRepo::list(conn, &session_id, after_seq))
            .await
    }

    async fn last_seq(&self, session_id: &SessionId, types: &[MessageType]) -> Result<Option<u64>> {
        let (session_id, types) = (session_id.clone(), types.to_vec());
        self.with_conn(move |conn| MessageRepo::last_seq(conn, &session_id, &types))
            .await
    }

    async fn mark_seq(&self, session_id: &SessionId, sender: &str, seq: u64) -> Result<()> {
        let (session_id, sender) = (session_id.clone(), sender.to_owned());
        self.with_conn(move |conn| MessageRepo::mark_seq(conn, &session_id, &sender, seq))
            .await
    }

    async fn seq_mark(&self, session_id: &SessionId, sender: &str) -> Result<Option<u64>> {
        let (session_id, sender) = (session_id.clone(), sender.to_owned());
        self.with_conn(move |conn| MessageRepo::seq_mark(conn, &session_id, &sender))
            .await
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use tether_core::models::SessionStatus;

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let session_id = {
            let store = SqliteStore::open(&path).unwrap();
            let machine = store
                .register_machine(&UserId::from("u1"), "box1", "Box")
                .await
                .unwrap();
            let session = Session::start(machine.id, "/work");
            store.create_session(&session).await.unwrap();
            session.id
        };

        let reopened = SqliteStore::open(&path).unwrap();
        let session = reopened.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn end_session_leaves_machine_alone() {
        let store = SqliteStore::in_memory().unwrap();
        let machine = store
            .register_machine(&UserId::from("u1"), "box1", "Box")
            .await
            .unwrap();
        let session = Session::start(machine.id.clone(), "/work");
        store.create_session(&session).await.unwrap();
        store.end_session(&session.id).await.unwrap();

        let machine = store.get_machine(&machine.id).await.unwrap().unwrap();
        assert_eq!(machine.status, MachineStatus::Online);
    }
}
