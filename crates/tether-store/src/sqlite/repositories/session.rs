//! Session repository.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use tether_core::ids::{MachineId, SessionId};
use tether_core::models::{Session, SessionStatus, SessionUpdate};

use super::{from_db_time, to_db_time};
use crate::errors::{Result, StoreError};

struct SessionRow {
    id: String,
    machine_id: String,
    status: String,
    working_directory: String,
    started_at: String,
    ended_at: Option<String>,
    title: Option<String>,
    model: Option<String>,
    resume_token: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            machine_id: row.get("machine_id")?,
            status: row.get("status")?,
            working_directory: row.get("working_directory")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            title: row.get("title")?,
            model: row.get("model")?,
            resume_token: row.get("resume_token")?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let status = SessionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("session status '{}'", self.status)))?;
        Ok(Session {
            id: SessionId::from(self.id),
            machine_id: MachineId::from(self.machine_id),
            status,
            working_directory: self.working_directory,
            started_at: from_db_time(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(from_db_time).transpose()?,
            title: self.title,
            model: self.model,
            resume_token: self.resume_token,
        })
    }
}

/// Session repository.
pub struct SessionRepo;

impl SessionRepo {
    /// Insert a session.
    pub fn create(conn: &Connection, session: &Session) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sessions
               (id, machine_id, status, working_directory, started_at, ended_at, title, model, resume_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id.as_str(),
                session.machine_id.as_str(),
                session.status.as_str(),
                session.working_directory,
                to_db_time(&session.started_at),
                session.ended_at.as_ref().map(to_db_time),
                session.title,
                session.model,
                session.resume_token,
            ],
        )?;
        Ok(())
    }

    /// Apply the non-`None` fields of `update`.
    pub fn update(conn: &Connection, id: &SessionId, update: &SessionUpdate) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sessions SET
               title = COALESCE(?2, title),
               model = COALESCE(?3, model),
               resume_token = COALESCE(?4, resume_token)
             WHERE id = ?1",
            params![id.as_str(), update.title, update.model, update.resume_token],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Flip to `ended` and stamp `ended_at`. Ending twice keeps the first
    /// `ended_at`.
    pub fn end(conn: &Connection, id: &SessionId) -> Result<Session> {
        let _ = conn.execute(
            "UPDATE sessions SET status = 'ended', ended_at = COALESCE(ended_at, ?2) WHERE id = ?1",
            params![id.as_str(), to_db_time(&Utc::now())],
        )?;
        Self::get(conn, id)?.ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Look up a session by id.
    pub fn get(conn: &Connection, id: &SessionId) -> Result<Option<Session>> {
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id.as_str()],
            SessionRow::from_row,
        )
        .optional()?
        .map(SessionRow::into_session)
        .transpose()
    }
}
