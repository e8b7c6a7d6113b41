//! Wire message catalog.
//!
//! Every message exchanged over a session's channels is a [`RealtimeMessage`]:
//! a flat JSON object with a `type` discriminator, a millisecond `timestamp`,
//! the sender's `seq`, and the type-specific fields of [`MessageBody`].
//!
//! ```json
//! { "type": "mode-change", "timestamp": 1767225600000, "seq": 4, "permissionMode": "plan" }
//! ```
//!
//! The set of types is closed. Anything that does not parse into the catalog
//! (unknown `type`, missing fields) is dropped by [`RealtimeMessage::parse`]
//! so newer peers never crash older ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::StoredMessage;

// ─────────────────────────────────────────────────────────────────────────────
// Message types
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminator of every message in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Viewer text input, optionally with attachments.
    Input,
    /// Daemon output chunk.
    Output,
    /// Daemon status / system line.
    System,
    /// Application-level liveness probe.
    Ping,
    /// Reply to a [`MessageType::Ping`].
    Pong,
    /// Viewer asks for a permission mode change.
    ModeChange,
    /// Daemon announces the effective permission mode.
    Mode,
    /// Viewer asks for a model change.
    ModelChange,
    /// Daemon announces the effective model.
    Model,
    /// Viewer asks for the model catalog.
    ModelsRequest,
    /// Daemon answers with the model catalog.
    Models,
    /// Viewer asks for the supported command list.
    CommandsRequest,
    /// Daemon answers with the supported command list.
    Commands,
    /// Viewer asks for an interactive configuration form.
    InteractiveRequest,
    /// Daemon answers with the form.
    InteractiveResponse,
    /// Viewer submits a form change.
    InteractiveApply,
    /// Daemon reports the outcome of a submitted change.
    InteractiveConfirm,
}

/// Which side of the bridge emits a message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Remote viewer to daemon.
    ToDaemon,
    /// Daemon to remote viewer.
    ToViewer,
    /// Either side.
    Either,
}

impl MessageType {
    /// Every message type, in catalog order.
    pub const ALL: [Self; 17] = [
        Self::Input,
        Self::Output,
        Self::System,
        Self::Ping,
        Self::Pong,
        Self::ModeChange,
        Self::Mode,
        Self::ModelChange,
        Self::Model,
        Self::ModelsRequest,
        Self::Models,
        Self::CommandsRequest,
        Self::Commands,
        Self::InteractiveRequest,
        Self::InteractiveResponse,
        Self::InteractiveApply,
        Self::InteractiveConfirm,
    ];

    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::System => "system",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ModeChange => "mode-change",
            Self::Mode => "mode",
            Self::ModelChange => "model-change",
            Self::Model => "model",
            Self::ModelsRequest => "models-request",
            Self::Models => "models",
            Self::CommandsRequest => "commands-request",
            Self::Commands => "commands",
            Self::InteractiveRequest => "interactive-request",
            Self::InteractiveResponse => "interactive-response",
            Self::InteractiveApply => "interactive-apply",
            Self::InteractiveConfirm => "interactive-confirm",
        }
    }

    /// Parse a wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether messages of this type are written to durable history.
    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Input | Self::Output | Self::System)
    }

    /// Whether this type expects exactly one reply.
    pub fn is_request(self) -> bool {
        self.response_type().is_some()
    }

    /// The reply type paired with a request type.
    pub fn response_type(self) -> Option<Self> {
        match self {
            Self::Ping => Some(Self::Pong),
            Self::ModeChange => Some(Self::Mode),
            Self::ModelChange => Some(Self::Model),
            Self::ModelsRequest => Some(Self::Models),
            Self::CommandsRequest => Some(Self::Commands),
            Self::InteractiveRequest => Some(Self::InteractiveResponse),
            Self::InteractiveApply => Some(Self::InteractiveConfirm),
            _ => None,
        }
    }

    /// Which side emits this type.
    pub fn direction(self) -> Direction {
        match self {
            Self::Input
            | Self::ModeChange
            | Self::ModelChange
            | Self::ModelsRequest
            | Self::CommandsRequest
            | Self::InteractiveRequest
            | Self::InteractiveApply => Direction::ToDaemon,
            Self::Output
            | Self::System
            | Self::Mode
            | Self::Model
            | Self::Models
            | Self::Commands
            | Self::InteractiveResponse
            | Self::InteractiveConfirm => Direction::ToViewer,
            Self::Ping | Self::Pong => Direction::Either,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload types
// ─────────────────────────────────────────────────────────────────────────────

/// Permission mode of the AI session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Ask before every privileged action.
    #[default]
    Default,
    /// Accept file edits without asking.
    AcceptEdits,
    /// Plan only, never execute.
    Plan,
    /// Skip all permission prompts.
    BypassPermissions,
}

impl PermissionMode {
    /// Wire / CLI name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// File attached to an `input` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Original file name.
    pub name: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Base64 encoded content.
    pub data: String,
}

/// Entry of the model catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Model identifier passed to the engine.
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Optional one-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Entry of the supported command list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    /// Command name without the leading slash.
    pub name: String,
    /// Optional one-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CommandInfo {
    /// Command with no description.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Control kind of one form option.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    /// Boolean switch.
    Toggle,
    /// One of a fixed list of choices.
    Select,
    /// Free text.
    Text,
}

/// One option of an interactive configuration form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveOption {
    /// Settings key the option writes.
    pub key: String,
    /// Label shown to the user.
    pub label: String,
    /// Control kind.
    pub kind: OptionKind,
    /// Current value.
    pub value: Value,
    /// Allowed values for [`OptionKind::Select`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

/// Interactive configuration form sent in `interactive-response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveData {
    /// Command the form belongs to.
    pub command: String,
    /// Form title.
    pub title: String,
    /// Form options; empty when the command is not supported.
    pub options: Vec<InteractiveOption>,
    /// Explanation shown alongside (or instead of) the options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Kind of change submitted with `interactive-apply`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractiveAction {
    /// Set a toggle option to a boolean.
    Toggle,
    /// Pick one of a select option's choices.
    Select,
    /// Set a text option.
    Set,
}

/// Change submitted with `interactive-apply`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractivePayload {
    /// Form command, e.g. `vim`.
    pub command: String,
    /// Kind of change.
    pub action: InteractiveAction,
    /// Option key; single-option forms may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// New value.
    pub value: Value,
}

/// Outcome carried by `interactive-confirm`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveResult {
    /// Whether the change was applied.
    pub success: bool,
    /// Human readable outcome.
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Message body and envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Type-specific part of a message, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MessageBody {
    /// Viewer text input.
    Input {
        /// Prompt text.
        content: String,
        /// Optional attachments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    /// Daemon output chunk.
    Output {
        /// Output text.
        content: String,
    },
    /// Daemon system line.
    System {
        /// System text.
        content: String,
    },
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong {
        /// `seq` of the ping being answered.
        ping_seq: u64,
    },
    /// Permission mode change request.
    ModeChange {
        /// Requested mode.
        permission_mode: PermissionMode,
    },
    /// Effective permission mode.
    Mode {
        /// Effective mode.
        permission_mode: PermissionMode,
    },
    /// Model change request.
    ModelChange {
        /// Requested model id.
        model: String,
    },
    /// Effective model.
    Model {
        /// Effective model id. Empty when no model is known yet.
        model: String,
        /// Why a requested switch did not happen.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Model catalog request.
    ModelsRequest,
    /// Model catalog.
    Models {
        /// Available models.
        available_models: Vec<ModelInfo>,
    },
    /// Command list request.
    CommandsRequest,
    /// Command list.
    Commands {
        /// Supported commands.
        commands: Vec<CommandInfo>,
    },
    /// Form request.
    InteractiveRequest {
        /// Form command.
        interactive_command: String,
    },
    /// Form.
    InteractiveResponse {
        /// Form contents.
        interactive_data: InteractiveData,
    },
    /// Form change.
    InteractiveApply {
        /// Submitted change.
        interactive_payload: InteractivePayload,
    },
    /// Form change outcome.
    InteractiveConfirm {
        /// Form command the outcome belongs to.
        interactive_command: String,
        /// Outcome.
        interactive_result: InteractiveResult,
    },
}

impl MessageBody {
    /// Discriminator of this body.
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Input { .. } => MessageType::Input,
            Self::Output { .. } => MessageType::Output,
            Self::System { .. } => MessageType::System,
            Self::Ping => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
            Self::ModeChange { .. } => MessageType::ModeChange,
            Self::Mode { .. } => MessageType::Mode,
            Self::ModelChange { .. } => MessageType::ModelChange,
            Self::Model { .. } => MessageType::Model,
            Self::ModelsRequest => MessageType::ModelsRequest,
            Self::Models { .. } => MessageType::Models,
            Self::CommandsRequest => MessageType::CommandsRequest,
            Self::Commands { .. } => MessageType::Commands,
            Self::InteractiveRequest { .. } => MessageType::InteractiveRequest,
            Self::InteractiveResponse { .. } => MessageType::InteractiveResponse,
            Self::InteractiveApply { .. } => MessageType::InteractiveApply,
            Self::InteractiveConfirm { .. } => MessageType::InteractiveConfirm,
        }
    }

    /// Text content of `input`, `output` and `system` bodies.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Input { content, .. } | Self::Output { content } | Self::System { content } => {
                Some(content)
            }
            _ => None,
        }
    }

    /// `output` body.
    pub fn output(content: impl Into<String>) -> Self {
        Self::Output {
            content: content.into(),
        }
    }

    /// `system` body.
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// `model` announcement.
    pub fn model(model: impl Into<String>) -> Self {
        Self::Model {
            model: model.into(),
            error: None,
        }
    }

    /// `input` body without attachments.
    pub fn input(content: impl Into<String>) -> Self {
        Self::Input {
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

/// Receiver-side dedup key. `seq` alone is not unique because each sender
/// keeps its own counter.
pub type DedupKey = (u64, MessageType);

/// A message as it travels over a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    /// Type and type-specific fields.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Sender-local sequence number.
    pub seq: u64,
}

impl RealtimeMessage {
    /// Stamp a body with `seq` and the current time.
    pub fn new(body: MessageBody, seq: u64) -> Self {
        Self {
            body,
            timestamp: chrono::Utc::now().timestamp_millis(),
            seq,
        }
    }

    /// Discriminator of the body.
    pub fn kind(&self) -> MessageType {
        self.body.kind()
    }

    /// Dedup key `(seq, type)`.
    pub fn dedup_key(&self) -> DedupKey {
        (self.seq, self.kind())
    }

    /// Text content, for `input`/`output`/`system`.
    pub fn content(&self) -> Option<&str> {
        self.body.content()
    }

    /// Parse a relay payload. Unknown types and malformed payloads yield
    /// `None`.
    pub fn parse(value: &Value) -> Option<Self> {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(message) => Some(message),
            Err(error) => {
                let message_type = value.get("type").and_then(serde_json::Value::as_str);
                tracing::debug!(message_type, %error, "ignoring unparseable message");
                None
            }
        }
    }

    /// Rebuild a message from a persisted history row.
    pub fn from_stored(row: &StoredMessage) -> Option<Self> {
        let body = match row.kind {
            MessageType::Input => MessageBody::input(row.content.clone()),
            MessageType::Output => MessageBody::output(row.content.clone()),
            MessageType::System => MessageBody::system(row.content.clone()),
            _ => return None,
        };
        Some(Self {
            body,
            timestamp: row.created_at.timestamp_millis(),
            seq: row.seq,
        })
    }

    /// Serialize to a JSON value for the relay.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use serde_json::json;

    #[test]
    fn type_names_round_trip_through_parse() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
            let wire = serde_json::to_value(t).unwrap();
            assert_eq!(wire, json!(t.as_str()));
        }
        assert_eq!(MessageType::parse("telepathy"), None);
    }

    #[test]
    fn only_io_types_are_persisted() {
        let persisted: Vec<_> = MessageType::ALL
            .into_iter()
            .filter(|t| t.is_persisted())
            .collect();
        assert_eq!(
            persisted,
            vec![MessageType::Input, MessageType::Output, MessageType::System]
        );
    }

    #[test]
    fn every_request_has_a_reply_flowing_the_other_way() {
        for t in MessageType::ALL.into_iter().filter(|t| t.is_request()) {
            let reply = t.response_type().unwrap();
            assert!(!reply.is_request());
            if t.direction() == Direction::ToDaemon {
                assert_eq!(reply.direction(), Direction::ToViewer);
            }
        }
        assert_eq!(
            MessageType::InteractiveApply.response_type(),
            Some(MessageType::InteractiveConfirm)
        );
    }

    #[test]
    fn envelope_is_flat_json() {
        let msg = RealtimeMessage {
            body: MessageBody::ModeChange {
                permission_mode: PermissionMode::AcceptEdits,
            },
            timestamp: 1_700_000_000_000,
            seq: 4,
        };
        let value = msg.to_value();
        assert_eq!(
            value,
            json!({
                "type": "mode-change",
                "permissionMode": "acceptEdits",
                "timestamp": 1_700_000_000_000_i64,
                "seq": 4
            })
        );
    }

    #[test]
    fn unit_bodies_parse() {
        let msg = RealtimeMessage::parse(&json!({"type": "ping", "timestamp": 1, "seq": 9})).unwrap();
        assert_eq!(msg.body, MessageBody::Ping);
        assert_eq!(msg.dedup_key(), (9, MessageType::Ping));
    }

    #[test]
    fn input_attachments_default_to_empty() {
        let msg = RealtimeMessage::parse(&json!({
            "type": "input", "content": "hi", "timestamp": 1, "seq": 1
        }))
        .unwrap();
        assert_eq!(msg.content(), Some("hi"));
        match msg.body {
            MessageBody::Input { attachments, .. } => assert!(attachments.is_empty()),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn interactive_apply_uses_camel_case_fields() {
        let msg = RealtimeMessage::parse(&json!({
            "type": "interactive-apply",
            "timestamp": 1,
            "seq": 2,
            "interactivePayload": {"command": "vim", "action": "toggle", "value": true}
        }))
        .unwrap();
        let MessageBody::InteractiveApply { interactive_payload } = msg.body else {
            panic!("wrong body");
        };
        assert_eq!(interactive_payload.command, "vim");
        assert_eq!(interactive_payload.action, InteractiveAction::Toggle);
        assert_eq!(interactive_payload.key, None);
        assert_eq!(interactive_payload.value, json!(true));
    }

    #[test]
    fn unknown_or_malformed_messages_are_dropped() {
        assert!(RealtimeMessage::parse(&json!({"type": "hologram", "timestamp": 1, "seq": 1})).is_none());
        assert!(RealtimeMessage::parse(&json!({"type": "model", "timestamp": 1, "seq": 1})).is_none());
        assert!(RealtimeMessage::parse(&json!("not an object")).is_none());
    }

    #[test]
    fn model_error_is_optional_on_the_wire() {
        let plain = RealtimeMessage::new(MessageBody::model("opus"), 2).to_value();
        assert!(plain.get("error").is_none());

        let refused = RealtimeMessage::parse(&json!({
            "type": "model",
            "model": "sonnet",
            "error": "could not switch to opus",
            "timestamp": 1,
            "seq": 3
        }))
        .unwrap();
        assert_eq!(
            refused.body,
            MessageBody::Model {
                model: "sonnet".into(),
                error: Some("could not switch to opus".into()),
            }
        );
    }

    #[test]
    fn stored_rows_map_created_at_to_timestamp() {
        let created_at = chrono::DateTime::from_timestamp_millis(1_700_000_123_456).unwrap();
        let row = StoredMessage {
            session_id: SessionId::from("s1"),
            kind: MessageType::Output,
            content: "done".into(),
            seq: 12,
            created_at,
        };
        let msg = RealtimeMessage::from_stored(&row).unwrap();
        assert_eq!(msg.timestamp, 1_700_000_123_456);
        assert_eq!(msg.seq, 12);
        assert_eq!(msg.body, MessageBody::output("done"));
    }

    #[test]
    fn ephemeral_rows_do_not_rebuild() {
        let row = StoredMessage {
            session_id: SessionId::from("s1"),
            kind: MessageType::Ping,
            content: String::new(),
            seq: 1,
            created_at: chrono::Utc::now(),
        };
        assert!(RealtimeMessage::from_stored(&row).is_none());
    }
}
