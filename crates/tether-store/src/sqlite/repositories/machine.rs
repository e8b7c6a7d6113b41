//! Machine repository.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use tether_core::ids::{MachineId, UserId};
use tether_core::models::{Machine, MachineStatus};

use super::{from_db_time, to_db_time};
use crate::errors::{Result, StoreError};

struct MachineRow {
    id: String,
    user_id: String,
    name: String,
    hostname: String,
    status: String,
    last_seen: String,
}

impl MachineRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            hostname: row.get("hostname")?,
            status: row.get("status")?,
            last_seen: row.get("last_seen")?,
        })
    }

    fn into_machine(self) -> Result<Machine> {
        let status = MachineStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("machine status '{}'", self.status)))?;
        Ok(Machine {
            id: MachineId::from(self.id),
            user_id: UserId::from(self.user_id),
            name: self.name,
            hostname: self.hostname,
            status,
            last_seen: from_db_time(&self.last_seen)?,
        })
    }
}

/// Machine repository.
pub struct MachineRepo;

impl MachineRepo {
    /// Insert or reactivate the machine for `(user_id, hostname)`.
    pub fn register(conn: &Connection, user_id: &UserId, hostname: &str, name: &str) -> Result<Machine> {
        let now = to_db_time(&Utc::now());
        let tx = conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM machines WHERE user_id = ?1 AND hostname = ?2",
                params![user_id.as_str(), hostname],
                |row| row.get(0),
            )
            .optional()?;

        let id = if let Some(id) = existing {
            let _ = tx.execute(
                "UPDATE machines SET status = 'online', last_seen = ?2, name = ?3 WHERE id = ?1",
                params![id, now, name],
            )?;
            id
        } else {
            let id = MachineId::new().into_inner();
            let _ = tx.execute(
                "INSERT INTO machines (id, user_id, name, hostname, status, last_seen)
                 VALUES (?1, ?2, ?3, ?4, 'online', ?5)",
                params![id, user_id.as_str(), name, hostname, now],
            )?;
            id
        };
        tx.commit()?;

        Self::get(conn, &MachineId::from(id.as_str()))?.ok_or(StoreError::MachineNotFound(id))
    }

    /// Set status and stamp `last_seen`.
    pub fn set_status(conn: &Connection, id: &MachineId, status: MachineStatus) -> Result<()> {
        let changed = conn.execute(
            "UPDATE machines SET status = ?2, last_seen = ?3 WHERE id = ?1",
            params![id.as_str(), status.as_str(), to_db_time(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::MachineNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Look up a machine by id.
    pub fn get(conn: &Connection, id: &MachineId) -> Result<Option<Machine>> {
        conn.query_row(
            "SELECT * FROM machines WHERE id = ?1",
            params![id.as_str()],
            MachineRow::from_row,
        )
        .optional()?
        .map(MachineRow::into_machine)
        .transpose()
    }
}
