//! Persisted entities: sessions, machines, message rows, conversation turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MachineId, SessionId, UserId};
use crate::messages::{MessageType, RealtimeMessage};

/// Lifecycle of a bridged session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Bridge is attached.
    Active,
    /// Bridge was stopped.
    Ended,
}

impl SessionStatus {
    /// Storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    /// Parse a storage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// One bridged AI session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Hosting machine.
    pub machine_id: MachineId,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Working directory of the AI session.
    pub working_directory: String,
    /// When the bridge started.
    pub started_at: DateTime<Utc>,
    /// When the bridge stopped.
    pub ended_at: Option<DateTime<Utc>>,
    /// Optional human title.
    pub title: Option<String>,
    /// Current model id.
    pub model: Option<String>,
    /// Resumable engine session token.
    pub resume_token: Option<String>,
}

impl Session {
    /// New active session started now.
    pub fn start(machine_id: MachineId, working_directory: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            machine_id,
            status: SessionStatus::Active,
            working_directory: working_directory.into(),
            started_at: Utc::now(),
            ended_at: None,
            title: None,
            model: None,
            resume_token: None,
        }
    }
}

/// Partial update of a session's mutable attributes. `None` leaves a field
/// unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    /// New title.
    pub title: Option<String>,
    /// New model.
    pub model: Option<String>,
    /// New resume token.
    pub resume_token: Option<String>,
}

/// Online state of a daemon host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Daemon is up.
    Online,
    /// Daemon is down.
    Offline,
}

impl MachineStatus {
    /// Storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    /// Parse a storage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// A daemon host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Machine id.
    pub id: MachineId,
    /// Owning user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Hostname; unique per user.
    pub hostname: String,
    /// Online state.
    pub status: MachineStatus,
    /// Last time the machine registered or changed status.
    pub last_seen: DateTime<Utc>,
}

/// A persisted history row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Owning session.
    pub session_id: SessionId,
    /// Message type; always one of the persisted types.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Text content.
    pub content: String,
    /// Sender seq.
    pub seq: u64,
    /// When the row was written; becomes the replayed `timestamp`.
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// History row for `message`, or `None` for ephemeral types.
    pub fn from_message(session_id: &SessionId, message: &RealtimeMessage) -> Option<Self> {
        if !message.kind().is_persisted() {
            return None;
        }
        Some(Self {
            session_id: session_id.clone(),
            kind: message.kind(),
            content: message.content().unwrap_or_default().to_owned(),
            seq: message.seq,
            created_at: DateTime::from_timestamp_millis(message.timestamp).unwrap_or_else(Utc::now),
        })
    }
}

/// Speaker of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human.
    User,
    /// The AI.
    Assistant,
}

/// One turn of conversation history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Speaker.
    pub role: Role,
    /// Text.
    pub content: String,
}

impl ConversationTurn {
    /// User turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
