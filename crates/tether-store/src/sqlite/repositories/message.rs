//! Message history repository.

use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use tether_core::ids::SessionId;
use tether_core::messages::MessageType;
use tether_core::models::StoredMessage;

use super::{from_db_time, seq_from_db, seq_to_db, to_db_time};
use crate::errors::{Result, StoreError};

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64, String)> {
    Ok((
        row.get("session_id")?,
        row.get("type")?,
        row.get("content")?,
        row.get("seq")?,
        row.get("created_at")?,
    ))
}

fn into_stored(
    (session_id, kind, content, seq, created_at): (String, String, String, i64, String),
) -> Result<StoredMessage> {
    Ok(StoredMessage {
        session_id: SessionId::from(session_id),
        kind: MessageType::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("message type '{kind}'")))?,
        content,
        seq: seq_from_db(seq),
        created_at: from_db_time(&created_at)?,
    })
}

/// Message history repository.
pub struct MessageRepo;

impl MessageRepo {
    /// Insert a row; duplicates of `(session, type, seq)` are ignored.
    /// Returns whether a row was written.
    pub fn append(conn: &Connection, message: &StoredMessage) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages (session_id, type, content, seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.session_id.as_str(),
                message.kind.as_str(),
                message.content,
                seq_to_db(message.seq),
                to_db_time(&message.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Rows of a session in `created_at` order.
    pub fn list(conn: &Connection, session_id: &SessionId, after_seq: Option<u64>) -> Result<Vec<StoredMessage>> {
        let mut stmt = conn.prepare(
            "SELECT session_id, type, content, seq, created_at FROM messages
             WHERE session_id = ?1 AND seq > ?2
             ORDER BY created_at, id",
        )?;
        let after = after_seq.map_or(-1, seq_to_db);
        let rows = stmt
            .query_map(params![session_id.as_str(), after], stored_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_stored).collect()
    }

    /// Highest `seq` among rows of `types`.
    pub fn last_seq(conn: &Connection, session_id: &SessionId, types: &[MessageType]) -> Result<Option<u64>> {
        if types.is_empty() {
            return Ok(None);
        }
        let placeholders = (0..types.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT MAX(seq) FROM messages WHERE session_id = ?1 AND type IN ({placeholders})"
        );
        let mut values: Vec<&str> = vec![session_id.as_str()];
        values.extend(types.iter().map(|t| t.as_str()));
        let max: Option<i64> = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(max.map(seq_from_db))
    }

    /// Raise the high-water seq of `sender`.
    pub fn mark_seq(conn: &Connection, session_id: &SessionId, sender: &str, seq: u64) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sequence_marks (session_id, sender, seq) VALUES (?1, ?2, ?3)
             ON CONFLICT (session_id, sender) DO UPDATE SET seq = MAX(seq, excluded.seq)",
            params![session_id.as_str(), sender, seq_to_db(seq)],
        )?;
        Ok(())
    }

    /// High-water seq of `sender`.
    pub fn seq_mark(conn: &Connection, session_id: &SessionId, sender: &str) -> Result<Option<u64>> {
        let seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sequence_marks WHERE session_id = ?1 AND sender = ?2",
                params![session_id.as_str(), sender],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.map(seq_from_db))
    }
}
