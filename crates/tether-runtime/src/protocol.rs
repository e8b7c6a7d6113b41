//! Command/response protocol, daemon side.
//!
//! Every request type gets exactly one reply, including when the answer is a
//! failure. Nothing here returns an error to the caller.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use tether_core::messages::{
    InteractiveData, InteractivePayload, InteractiveResult, MessageBody, MessageType,
    RealtimeMessage,
};
use tether_settings::{InteractiveCatalog, SettingsStore};

use crate::adapter::AiSessionAdapter;

/// Answers inbound requests from the adapter and the settings store.
pub struct CommandResponder {
    adapter: Arc<AiSessionAdapter>,
    settings: Arc<dyn SettingsStore>,
}

impl CommandResponder {
    /// Responder over `adapter` and `settings`.
    pub fn new(adapter: Arc<AiSessionAdapter>, settings: Arc<dyn SettingsStore>) -> Self {
        Self { adapter, settings }
    }

    /// Reply to `message`, or `None` when it is not a request.
    pub async fn respond(&self, message: &RealtimeMessage) -> Option<MessageBody> {
        let reply = match &message.body {
            MessageBody::Ping => MessageBody::Pong {
                ping_seq: message.seq,
            },
            MessageBody::ModeChange { permission_mode } => {
                self.adapter.set_permission_mode(*permission_mode);
                info!(mode = permission_mode.as_str(), "permission mode changed");
                MessageBody::Mode {
                    permission_mode: *permission_mode,
                }
            }
            MessageBody::ModelChange { model } => self.change_model(model).await,
            MessageBody::ModelsRequest => MessageBody::Models {
                available_models: self.adapter.supported_models().await,
            },
            MessageBody::CommandsRequest => MessageBody::Commands {
                commands: self.adapter.commands(),
            },
            MessageBody::InteractiveRequest {
                interactive_command,
            } => MessageBody::InteractiveResponse {
                interactive_data: self.describe(interactive_command).await,
            },
            MessageBody::InteractiveApply {
                interactive_payload,
            } => MessageBody::InteractiveConfirm {
                interactive_command: interactive_payload.command.clone(),
                interactive_result: self.apply(interactive_payload).await,
            },
            _ => return None,
        };
        debug_assert_eq!(message.kind().response_type(), Some(reply.kind()));
        debug!(request = %message.kind(), reply = %reply.kind(), seq = message.seq, "request answered");
        Some(reply)
    }

    async fn change_model(&self, model: &str) -> MessageBody {
        match self.adapter.set_model(model).await {
            Ok(event) => MessageBody::model(event.model),
            Err(error) => {
                warn!(model, %error, "model change failed");
                metrics::counter!("bridge_protocol_failures_total", "type" => "model-change")
                    .increment(1);
                // The session keeps whatever it last ran; the error says why.
                let state = self.adapter.model_state();
                MessageBody::Model {
                    model: state.current.or(state.pending).unwrap_or_default(),
                    error: Some(format!("could not switch to {model}: {error}")),
                }
            }
        }
    }

    async fn catalog(&self) -> InteractiveCatalog {
        InteractiveCatalog::new(&self.adapter.supported_models().await)
    }

    async fn describe(&self, command: &str) -> InteractiveData {
        let settings = self.settings.read().await.unwrap_or_else(|error| {
            warn!(%error, "settings unreadable, describing defaults");
            json!({})
        });
        let mut data = self.catalog().await.describe(command, &settings);
        if data.command == "model" {
            // The model form shows what the session runs, not the file default.
            if let (Some(current), Some(option)) = (self.adapter.current_model(), data.options.first_mut()) {
                option.value = Value::String(current);
            }
        }
        data
    }

    async fn apply(&self, payload: &InteractivePayload) -> InteractiveResult {
        match self.try_apply(payload).await {
            Ok(message) => InteractiveResult {
                success: true,
                message,
            },
            Err(message) => {
                warn!(command = %payload.command, %message, "interactive apply failed");
                metrics::counter!("bridge_protocol_failures_total", "type" => "interactive-apply")
                    .increment(1);
                InteractiveResult {
                    success: false,
                    message,
                }
            }
        }
    }

    async fn try_apply(&self, payload: &InteractivePayload) -> Result<String, String> {
        let current = self.settings.read().await.map_err(|e| e.to_string())?;
        let applied = self
            .catalog()
            .await
            .apply(payload, current)
            .map_err(|e| e.to_string())?;
        self.settings
            .write(applied.settings)
            .await
            .map_err(|e| e.to_string())?;

        if applied.key == "model" {
            if let Some(model) = applied.value.as_str() {
                self.adapter.set_model(model).await.map_err(|e| e.to_string())?;
            }
        }
        info!(command = %payload.command, key = %applied.key, "setting applied");
        Ok(applied.message)
    }
}

/// Whether `kind` is answered by [`CommandResponder`].
pub fn is_answered(kind: MessageType) -> bool {
    kind.is_request()
}
