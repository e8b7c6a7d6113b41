//! Bridge configuration types.
//!
//! Every struct uses `#[serde(default)]` so a partial `bridge.json` only has
//! to name the values it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tether_core::messages::PermissionMode;
use tether_core::retry::BackoffPolicy;

/// Root configuration of the bridge daemon.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Connection health monitor tunables.
    pub health: HealthSettings,
    /// Channel transport tunables.
    pub transport: TransportSettings,
    /// Hosted relay endpoint.
    pub relay: RelaySettings,
    /// AI engine invocation.
    pub engine: EngineSettings,
    /// Durable storage.
    pub storage: StorageSettings,
    /// Location of the AI tool's own settings document.
    pub settings_store: SettingsStoreSettings,
}

/// Heartbeat, liveness timeout and reconnect policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    /// Interval between heartbeat ticks in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Liveness timeout in milliseconds.
    pub liveness_timeout_ms: u64,
    /// Reconnect backoff.
    pub reconnect: BackoffPolicy,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            liveness_timeout_ms: 30_000,
            reconnect: BackoffPolicy::default(),
        }
    }
}

impl HealthSettings {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Liveness timeout as a `Duration`.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

/// Channel transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// How long to wait for a subscription to confirm, in milliseconds.
    pub subscribe_timeout_ms: u64,
    /// Whether input/output/system messages are written to storage.
    pub persist_messages: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            subscribe_timeout_ms: 10_000,
            persist_messages: true,
        }
    }
}

impl TransportSettings {
    /// Subscription timeout as a `Duration`.
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

/// Hosted relay endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Websocket URL of the relay; `None` runs local-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// API key sent when connecting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Relay socket heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            heartbeat_interval_ms: 25_000,
        }
    }
}

/// AI engine invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Executable of the CLI coding agent.
    pub command: String,
    /// Model used for new sessions; engine default when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Initial permission mode.
    pub permission_mode: PermissionMode,
    /// Extra arguments appended to every invocation.
    pub extra_args: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            default_model: None,
            permission_mode: PermissionMode::Default,
            extra_args: Vec::new(),
        }
    }
}

/// Durable storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Database file, relative to `~/.tether` unless absolute.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "bridge.db".to_string(),
        }
    }
}

impl StorageSettings {
    /// Absolute database path.
    pub fn resolved_path(&self) -> PathBuf {
        resolve_under(crate::loader::tether_home(), &self.database_path)
    }
}

/// Location of the JSON settings document edited by interactive forms.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsStoreSettings {
    /// Document path; `~/.claude/settings.json` when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SettingsStoreSettings {
    /// Absolute document path.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => resolve_under(crate::loader::home_dir(), p),
            None => crate::loader::home_dir().join(".claude").join("settings.json"),
        }
    }
}

fn resolve_under(base: PathBuf, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { base.join(p) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = BridgeSettings::default();
        assert_eq!(s.health.heartbeat_interval_ms, 15_000);
        assert_eq!(s.health.liveness_timeout_ms, 30_000);
        assert_eq!(s.health.reconnect.max_retries, 10);
        assert_eq!(s.transport.subscribe_timeout(), Duration::from_secs(10));
        assert!(s.transport.persist_messages);
        assert_eq!(s.engine.command, "claude");
        assert!(s.relay.url.is_none());
    }

    #[test]
    fn camel_case_wire_format() {
        let v = serde_json::to_value(BridgeSettings::default()).unwrap();
        assert!(v["health"]["heartbeatIntervalMs"].is_u64());
        assert!(v["health"]["reconnect"]["maxRetries"].is_u64());
        assert!(v["transport"]["subscribeTimeoutMs"].is_u64());
        assert!(v["settingsStore"].is_object());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: BridgeSettings =
            serde_json::from_str(r#"{"health": {"livenessTimeoutMs": 5000}}"#).unwrap();
        assert_eq!(s.health.liveness_timeout_ms, 5000);
        assert_eq!(s.health.heartbeat_interval_ms, 15_000);
    }

    #[test]
    fn absolute_paths_are_kept() {
        let s = StorageSettings {
            database_path: "/var/lib/tether.db".into(),
        };
        assert_eq!(s.resolved_path(), PathBuf::from("/var/lib/tether.db"));
    }
}
