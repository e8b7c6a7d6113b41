//! AI completion engine collaborator.
//!
//! [`AiEngine`] is the narrow interface the adapter drives. [`ProcessEngine`]
//! runs a CLI coding agent once per prompt in `--output-format stream-json`
//! mode and turns its JSON lines into [`EngineEvent`]s.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use tether_core::messages::{Attachment, ModelInfo, PermissionMode};
use tether_core::models::{ConversationTurn, Role};

use crate::errors::{EngineError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Interface
// ─────────────────────────────────────────────────────────────────────────────

/// One prompt submission.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptRequest {
    /// Prompt text.
    pub text: String,
    /// Attachments sent with the prompt.
    pub attachments: Vec<Attachment>,
    /// Engine session to resume.
    pub resume: Option<String>,
    /// Model for this prompt; engine default when `None`.
    pub model: Option<String>,
    /// Prior conversation replayed into a fresh engine session.
    pub seed_context: Vec<ConversationTurn>,
    /// Permission mode for this prompt.
    pub permission_mode: PermissionMode,
}

/// Event streamed back for a prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Session metadata, usually first.
    System {
        /// Engine session token.
        session_id: Option<String>,
        /// Model the engine is actually using.
        model: Option<String>,
        /// Commands the engine supports in this session.
        commands: Vec<String>,
        /// Text worth showing to the user, if any.
        content: Option<String>,
    },
    /// Assistant text.
    Assistant {
        /// Text block.
        text: String,
    },
    /// Turn finished.
    Result {
        /// Engine session token.
        session_id: Option<String>,
        /// Final answer text.
        text: String,
        /// Whether the turn failed.
        is_error: bool,
    },
}

/// Stream of events for one prompt.
pub type EngineEventStream = Pin<Box<dyn Stream<Item = Result<EngineEvent>> + Send>>;

/// The AI completion engine.
#[async_trait]
pub trait AiEngine: Send + Sync {
    /// Submit a prompt and stream its events.
    async fn send_prompt(&self, request: PromptRequest) -> Result<EngineEventStream>;

    /// Default model for prompts that do not name one.
    async fn set_model(&self, model: &str) -> Result<()>;

    /// Models the engine can use.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Small catalog used before the engine has reported anything.
pub fn fallback_models() -> Vec<ModelInfo> {
    [
        ("sonnet", "Claude Sonnet", "Balanced default for everyday coding"),
        ("opus", "Claude Opus", "Most capable, slower"),
        ("haiku", "Claude Haiku", "Fastest, for quick edits"),
    ]
    .into_iter()
    .map(|(id, name, description)| ModelInfo {
        id: id.to_owned(),
        name: name.to_owned(),
        description: Some(description.to_owned()),
    })
    .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// stream-json parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse one `stream-json` line. Lines that carry nothing for the bridge
/// (tool results, unknown types, blank lines) yield `None`.
pub fn parse_stream_line(line: &str) -> Option<Result<EngineEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(Err(EngineError::Protocol(format!("bad stream line: {e}")))),
    };
    let str_field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);

    match value.get("type").and_then(Value::as_str)? {
        "system" => {
            let commands = value
                .get("slash_commands")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(|c| c.trim_start_matches('/').to_owned())
                        .collect()
                })
                .unwrap_or_default();
            let content = match value.get("subtype").and_then(Value::as_str) {
                Some("init") | None => None,
                Some(_) => str_field("message"),
            };
            Some(Ok(EngineEvent::System {
                session_id: str_field("session_id"),
                model: str_field("model"),
                commands,
                content,
            }))
        }
        "assistant" => {
            let text = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            (!text.is_empty()).then_some(Ok(EngineEvent::Assistant { text }))
        }
        "result" => Some(Ok(EngineEvent::Result {
            session_id: str_field("session_id"),
            text: str_field("result").unwrap_or_default(),
            is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        })),
        _ => None,
    }
}

/// Prompt text with seed context and attachment references prepended.
pub fn compose_prompt(request: &PromptRequest) -> String {
    let mut prompt = String::new();
    if !request.seed_context.is_empty() {
        prompt.push_str("Conversation so far:\n\n");
        for turn in &request.seed_context {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            prompt.push_str(speaker);
            prompt.push_str(": ");
            prompt.push_str(&turn.content);
            prompt.push_str("\n\n");
        }
        prompt.push_str("---\n\n");
    }
    for attachment in &request.attachments {
        prompt.push_str(&format!(
            "[attachment: {} ({}, {} bytes base64)]\n",
            attachment.name,
            attachment.mime_type,
            attachment.data.len()
        ));
    }
    prompt.push_str(&request.text);
    prompt
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-backed engine
// ─────────────────────────────────────────────────────────────────────────────

/// Runs the coding agent CLI once per prompt.
pub struct ProcessEngine {
    command: String,
    extra_args: Vec<String>,
    working_directory: PathBuf,
    default_model: RwLock<Option<String>>,
}

impl ProcessEngine {
    /// Engine invoking `command` in `working_directory`.
    pub fn new(
        command: impl Into<String>,
        extra_args: Vec<String>,
        working_directory: impl Into<PathBuf>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            command: command.into(),
            extra_args,
            working_directory: working_directory.into(),
            default_model: RwLock::new(default_model),
        }
    }

    /// Command-line arguments for `request`.
    pub fn args(&self, request: &PromptRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_owned(),
            compose_prompt(request),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
        ];
        if let Some(resume) = &request.resume {
            args.extend(["--resume".to_owned(), resume.clone()]);
        }
        if let Some(model) = request.model.clone().or_else(|| self.default_model.read().clone()) {
            args.extend(["--model".to_owned(), model]);
        }
        args.extend([
            "--permission-mode".to_owned(),
            request.permission_mode.as_str().to_owned(),
        ]);
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl AiEngine for ProcessEngine {
    async fn send_prompt(&self, request: PromptRequest) -> Result<EngineEventStream> {
        let args = self.args(&request);
        debug!(
            command = %self.command,
            resume = request.resume.is_some(),
            seeded = !request.seed_context.is_empty(),
            "spawning engine"
        );
        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&self.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                command: self.command.clone(),
                message: e.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Unavailable("stdout not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Unavailable("stderr not captured".into()))?;

        Ok(Box::pin(async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_stream_line(&line) {
                            if matches!(event, Ok(EngineEvent::Result { .. })) {
                                saw_result = true;
                            }
                            yield event;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(EngineError::Io(e));
                        break;
                    }
                }
            }

            let mut err_text = String::new();
            let _ = stderr.read_to_string(&mut err_text).await;
            match child.wait().await {
                Ok(status) if status.success() || saw_result => {}
                Ok(status) => {
                    warn!(code = ?status.code(), "engine exited unsuccessfully");
                    yield Err(EngineError::Exited {
                        code: status.code(),
                        stderr: tail(&err_text, 2000),
                    });
                }
                Err(e) => yield Err(EngineError::Io(e)),
            }
        }))
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        *self.default_model.write() = Some(model.to_owned());
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        // The CLI has no model listing; it accepts these aliases.
        Ok(fallback_models())
    }
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_owned();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_init_system_line() {
        let event = parse_stream_line(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet","slash_commands":["/clear","compact"]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            EngineEvent::System {
                session_id: Some("abc".into()),
                model: Some("claude-sonnet".into()),
                commands: vec!["clear".into(), "compact".into()],
                content: None,
            }
        );
    }

    #[test]
    fn joins_assistant_text_blocks_and_skips_tool_use() {
        let event = parse_stream_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello "},{"type":"tool_use","name":"Bash"},{"type":"text","text":"world"}]}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event, EngineEvent::Assistant { text: "Hello world".into() });

        assert!(parse_stream_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash"}]}}"#
        )
        .is_none());
    }

    #[test]
    fn parses_result_line() {
        let event = parse_stream_line(
            r#"{"type":"result","subtype":"success","is_error":false,"result":"Done.","session_id":"abc"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            EngineEvent::Result {
                session_id: Some("abc".into()),
                text: "Done.".into(),
                is_error: false,
            }
        );
    }

    #[test]
    fn ignores_blank_and_unknown_lines_but_flags_garbage() {
        assert!(parse_stream_line("   ").is_none());
        assert!(parse_stream_line(r#"{"type":"user","message":{}}"#).is_none());
        assert_matches!(parse_stream_line("{oops"), Some(Err(EngineError::Protocol(_))));
    }

    #[test]
    fn seed_context_is_prefixed_once() {
        let request = PromptRequest {
            text: "and now?".into(),
            seed_context: vec![
                ConversationTurn::user("fix the bug"),
                ConversationTurn::assistant("fixed"),
            ],
            ..PromptRequest::default()
        };
        let prompt = compose_prompt(&request);
        assert!(prompt.starts_with("Conversation so far:"));
        assert!(prompt.contains("User: fix the bug"));
        assert!(prompt.contains("Assistant: fixed"));
        assert!(prompt.ends_with("---\n\nand now?"));
    }

    #[test]
    fn args_carry_resume_model_and_mode() {
        let engine = ProcessEngine::new("claude", vec!["--debug".into()], "/tmp", Some("opus".into()));
        let args = engine.args(&PromptRequest {
            text: "hi".into(),
            resume: Some("tok".into()),
            permission_mode: PermissionMode::Plan,
            ..PromptRequest::default()
        });
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--resume tok"));
        assert!(joined.contains("--model opus"));
        assert!(joined.contains("--permission-mode plan"));
        assert!(joined.ends_with("--debug"));

        let fresh = engine.args(&PromptRequest {
            text: "hi".into(),
            model: Some("haiku".into()),
            ..PromptRequest::default()
        });
        assert!(!fresh.contains(&"--resume".to_owned()));
        assert!(fresh.join(" ").contains("--model haiku"));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("  short  ", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
    }
}
