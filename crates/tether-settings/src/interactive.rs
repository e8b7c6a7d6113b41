//! Interactive configuration forms.
//!
//! A viewer asks for a form with `interactive-request`, renders the returned
//! [`InteractiveData`], and submits one change with `interactive-apply`. The
//! catalog validates the change against the form and produces the mutated
//! settings document; persisting it is the caller's job.

use serde_json::{Map, Value};

use tether_core::messages::{
    InteractiveAction, InteractiveData, InteractiveOption, InteractivePayload, ModelInfo,
    OptionKind,
};

use crate::errors::{Result, SettingsError};

/// One option of a form definition.
#[derive(Clone, Debug)]
struct OptionSpec {
    key: &'static str,
    label: &'static str,
    kind: OptionKind,
    default: Value,
    choices: Vec<String>,
}

impl OptionSpec {
    fn toggle(key: &'static str, label: &'static str, default: bool) -> Self {
        Self {
            key,
            label,
            kind: OptionKind::Toggle,
            default: Value::Bool(default),
            choices: Vec::new(),
        }
    }

    fn select(key: &'static str, label: &'static str, choices: Vec<String>, default: &str) -> Self {
        Self {
            key,
            label,
            kind: OptionKind::Select,
            default: Value::String(default.to_string()),
            choices,
        }
    }

    fn text(key: &'static str, label: &'static str) -> Self {
        Self {
            key,
            label,
            kind: OptionKind::Text,
            default: Value::String(String::new()),
            choices: Vec::new(),
        }
    }

    fn accepts(&self, action: InteractiveAction, value: &Value) -> std::result::Result<(), String> {
        match (self.kind, action) {
            (OptionKind::Toggle, InteractiveAction::Toggle) => value
                .is_boolean()
                .then_some(())
                .ok_or_else(|| format!("{} expects true or false", self.key)),
            (OptionKind::Select, InteractiveAction::Select) => match value.as_str() {
                Some(v) if self.choices.iter().any(|c| c == v) => Ok(()),
                _ => Err(format!(
                    "{} must be one of: {}",
                    self.key,
                    self.choices.join(", ")
                )),
            },
            (OptionKind::Text, InteractiveAction::Set) => value
                .is_string()
                .then_some(())
                .ok_or_else(|| format!("{} expects text", self.key)),
            (kind, action) => Err(format!(
                "cannot {action:?} option {} of kind {kind:?}",
                self.key
            )
            .to_lowercase()),
        }
    }
}

#[derive(Clone, Debug)]
struct FormSpec {
    command: &'static str,
    title: &'static str,
    options: Vec<OptionSpec>,
}

/// Result of a successful apply.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedChange {
    /// Settings document with the change applied.
    pub settings: Value,
    /// Key that was written.
    pub key: String,
    /// New value.
    pub value: Value,
    /// Human readable confirmation.
    pub message: String,
}

/// Registry of the interactive forms the daemon can serve.
#[derive(Clone, Debug)]
pub struct InteractiveCatalog {
    forms: Vec<FormSpec>,
}

const THEMES: [&str; 4] = ["dark", "light", "dark-daltonized", "light-daltonized"];

impl InteractiveCatalog {
    /// Catalog with the built-in forms. `models` populates the model picker.
    pub fn new(models: &[ModelInfo]) -> Self {
        let model_ids: Vec<String> = models.iter().map(|m| m.id.clone()).collect();
        let default_model = model_ids.first().cloned().unwrap_or_default();
        let forms = vec![
            FormSpec {
                command: "config",
                title: "Configuration",
                options: vec![
                    OptionSpec::toggle("autoCompactEnabled", "Auto-compact", true),
                    OptionSpec::toggle("verbose", "Verbose output", false),
                    OptionSpec::toggle("includeCoAuthoredBy", "Co-authored-by trailer", true),
                    OptionSpec::text("preferredNotifChannel", "Notification channel"),
                ],
            },
            FormSpec {
                command: "vim",
                title: "Vim mode",
                options: vec![OptionSpec::toggle("vim", "Vim key bindings", false)],
            },
            FormSpec {
                command: "theme",
                title: "Theme",
                options: vec![OptionSpec::select(
                    "theme",
                    "Color theme",
                    THEMES.iter().map(|t| (*t).to_string()).collect(),
                    "dark",
                )],
            },
            FormSpec {
                command: "model",
                title: "Model",
                options: vec![OptionSpec::select("model", "Model", model_ids, &default_model)],
            },
        ];
        Self { forms }
    }

    /// Commands that have a form.
    pub fn commands(&self) -> Vec<&'static str> {
        self.forms.iter().map(|f| f.command).collect()
    }

    fn form(&self, command: &str) -> Option<&FormSpec> {
        let command = command.trim_start_matches('/');
        self.forms.iter().find(|f| f.command == command)
    }

    /// Describe the form for `command` with current values from `settings`.
    ///
    /// Unknown commands yield a form with no options and an explanatory
    /// message.
    pub fn describe(&self, command: &str, settings: &Value) -> InteractiveData {
        let Some(form) = self.form(command) else {
            return InteractiveData {
                command: command.to_string(),
                title: command.to_string(),
                options: Vec::new(),
                message: Some(format!(
                    "/{} has no interactive form here",
                    command.trim_start_matches('/')
                )),
            };
        };

        let options = form
            .options
            .iter()
            .map(|spec| InteractiveOption {
                key: spec.key.to_string(),
                label: spec.label.to_string(),
                kind: spec.kind,
                value: settings
                    .get(spec.key)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| spec.default.clone()),
                choices: spec.choices.clone(),
            })
            .collect();

        InteractiveData {
            command: form.command.to_string(),
            title: form.title.to_string(),
            options,
            message: None,
        }
    }

    /// Validate `payload` and apply it to `settings`.
    ///
    /// A `null` document counts as empty. Any other non-object document is
    /// rejected so the caller never overwrites it.
    pub fn apply(&self, payload: &InteractivePayload, settings: Value) -> Result<AppliedChange> {
        let form = self
            .form(&payload.command)
            .ok_or_else(|| SettingsError::UnknownCommand(payload.command.clone()))?;

        let spec = match payload.key.as_deref() {
            Some(key) => form.options.iter().find(|o| o.key == key),
            None if form.options.len() == 1 => form.options.first(),
            None => None,
        }
        .ok_or_else(|| SettingsError::UnknownOption {
            command: form.command.to_string(),
            key: payload.key.clone().unwrap_or_default(),
        })?;

        spec.accepts(payload.action, &payload.value)
            .map_err(SettingsError::InvalidValue)?;

        let mut document = match settings {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            Value::Bool(_) => return Err(SettingsError::NotAnObject("boolean")),
            Value::Number(_) => return Err(SettingsError::NotAnObject("number")),
            Value::String(_) => return Err(SettingsError::NotAnObject("string")),
            Value::Array(_) => return Err(SettingsError::NotAnObject("array")),
        };
        let _ = document.insert(spec.key.to_string(), payload.value.clone());

        Ok(AppliedChange {
            settings: Value::Object(document),
            key: spec.key.to_string(),
            value: payload.value.clone(),
            message: format!("{} set to {}", spec.label, display_value(&payload.value)),
        })
    }
}

impl Default for InteractiveCatalog {
    fn default() -> Self {
        Self::new(&[])
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        other => other.to_string(),
    }
}
