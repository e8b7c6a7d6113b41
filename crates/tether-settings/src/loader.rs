//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BridgeSettings::default()`]
//! 2. If `~/.tether/bridge.json` exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BridgeSettings;

/// The user's home directory (`/tmp` if `HOME` is unset).
pub fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `~/.tether`.
pub fn tether_home() -> PathBuf {
    home_dir().join(".tether")
}

/// Resolve the path to the settings file (`~/.tether/bridge.json`).
pub fn settings_path() -> PathBuf {
    tether_home().join("bridge.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let defaults = serde_json::to_value(BridgeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading bridge settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "bridge settings file not found, using defaults");
        defaults
    };

    let mut settings: BridgeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut BridgeSettings) {
    // ── Health ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.health.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_LIVENESS_TIMEOUT_MS", 100, 3_600_000) {
        settings.health.liveness_timeout_ms = v;
    }
    if let Some(v) = read_env_u32("TETHER_MAX_RETRIES", 0, 1000) {
        settings.health.reconnect.max_retries = v;
    }
    if let Some(v) = read_env_u64("TETHER_RETRY_BASE_DELAY_MS", 10, 600_000) {
        settings.health.reconnect.base_delay_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_RETRY_MAX_DELAY_MS", 10, 3_600_000) {
        settings.health.reconnect.max_delay_ms = v;
    }

    // ── Transport / relay ───────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_SUBSCRIBE_TIMEOUT_MS", 100, 600_000) {
        settings.transport.subscribe_timeout_ms = v;
    }
    if let Some(v) = read_env_bool("TETHER_PERSIST_MESSAGES") {
        settings.transport.persist_messages = v;
    }
    if let Some(v) = read_env_string("TETHER_RELAY_URL") {
        settings.relay.url = Some(v);
    }
    if let Some(v) = read_env_string("TETHER_API_KEY") {
        settings.relay.api_key = Some(v);
    }

    // ── Engine / storage ────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_ENGINE_COMMAND") {
        settings.engine.command = v;
    }
    if let Some(v) = read_env_string("TETHER_MODEL") {
        settings.engine.default_model = Some(v);
    }
    if let Some(v) = read_env_string("TETHER_DB_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = read_env_string("TETHER_SETTINGS_STORE") {
        settings.settings_store.path = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
