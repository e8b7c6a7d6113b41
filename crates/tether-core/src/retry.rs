//! Reconnect backoff configuration and delay math.
//!
//! Sync-only building blocks. The async retry loop lives in
//! `tether-transport::health`, which owns the clock and the randomness.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum reconnect attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff parameters for the reconnect loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Maximum number of reconnect attempts (default: 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter factor (default: 0.2, i.e. ±20%).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry `attempt` (zero-based).
    pub fn nominal_delay_ms(&self, attempt: u32) -> u64 {
        nominal_backoff_ms(attempt, self.base_delay_ms, self.max_delay_ms)
    }

    /// Jittered delay before retry `attempt`, using `random` in `[0, 1)`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// `min(base * 2^attempt, max)`.
#[must_use]
pub fn nominal_backoff_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}

/// Backoff delay with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0)`. It is mapped onto
/// `[-jitter, +jitter]` around the nominal delay.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let capped = nominal_backoff_ms(attempt, base_delay_ms, max_delay_ms);
    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;
    with_jitter.round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reconnect_policy() {
        let p = BackoffPolicy::default();
        assert_eq!(p.max_retries, 10);
        assert_eq!(p.base_delay_ms, 1000);
        assert_eq!(p.max_delay_ms, 30_000);
        assert!((p.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn nominal_doubles_then_caps() {
        let p = BackoffPolicy::default();
        assert_eq!(p.nominal_delay_ms(0), 1000);
        assert_eq!(p.nominal_delay_ms(1), 2000);
        assert_eq!(p.nominal_delay_ms(4), 16_000);
        assert_eq!(p.nominal_delay_ms(5), 30_000);
        assert_eq!(p.nominal_delay_ms(40), 30_000);
    }

    #[test]
    fn jitter_bounds() {
        assert_eq!(calculate_backoff_delay_with_random(1, 1000, 30_000, 0.2, 0.0), 1600);
        assert_eq!(calculate_backoff_delay_with_random(1, 1000, 30_000, 0.2, 0.5), 2000);
        assert_eq!(calculate_backoff_delay_with_random(1, 1000, 30_000, 0.2, 1.0), 2400);
    }

    #[test]
    fn every_delay_within_twenty_percent() {
        let p = BackoffPolicy::default();
        for attempt in 0..12 {
            let nominal = p.nominal_delay_ms(attempt);
            for i in 0..=10 {
                let r = f64::from(i) / 10.0;
                let d = u64::try_from(p.delay_with_random(attempt, r).as_millis()).unwrap();
                assert!(d >= nominal * 8 / 10 && d <= nominal * 12 / 10, "{d} vs {nominal}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(calculate_backoff_delay_with_random(3, 500, 60_000, 0.0, 0.9), 4000);
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let p: BackoffPolicy = serde_json::from_str(r#"{"maxRetries": 3}"#).unwrap();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay_ms, DEFAULT_BASE_DELAY_MS);
    }
}
