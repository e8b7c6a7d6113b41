//! Channel naming and presence payloads.
//!
//! Channel names are a pure function of the session (or machine) id; nothing
//! else in the workspace formats them by hand.

use serde::{Deserialize, Serialize};

use crate::ids::{MachineId, SessionId};

/// The three relay channels of one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionChannels {
    /// Daemon → viewer stream.
    pub output: String,
    /// Viewer → daemon stream.
    pub input: String,
    /// Who is attached to the session.
    pub presence: String,
}

impl SessionChannels {
    /// Channel names for `session_id`.
    pub fn for_session(session_id: &SessionId) -> Self {
        Self {
            output: format!("session-output-{session_id}"),
            input: format!("session-input-{session_id}"),
            presence: format!("session-presence-{session_id}"),
        }
    }
}

/// Presence channel announcing whether a machine's daemon is up.
pub fn machine_presence(machine_id: &MachineId) -> String {
    format!("machine-presence-{machine_id}")
}

/// Control channel addressed to one machine.
pub fn machine_control(machine_id: &MachineId) -> String {
    format!("machine-control-{machine_id}")
}

/// Kind of participant in a presence channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    /// The daemon side.
    Cli,
    /// A remote viewer.
    Viewer,
}

impl PresenceKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Viewer => "viewer",
        }
    }
}

/// Payload tracked on presence channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    /// Participant kind.
    #[serde(rename = "type")]
    pub kind: PresenceKind,
    /// RFC 3339 time the participant came online.
    pub online_at: String,
}

impl PresencePayload {
    /// Payload stamped with the current time.
    pub fn now(kind: PresenceKind) -> Self {
        Self {
            kind,
            online_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
