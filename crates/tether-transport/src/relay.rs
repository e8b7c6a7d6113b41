//! The hosted relay, seen through the narrow interface the bridge needs:
//! named channels with broadcast delivery and presence tracking.
//!
//! Delivery is at most once and usually in order while connected. Nothing
//! here retries; that is the transport's and health monitor's job.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use tether_core::BridgeError;

/// Presence state of a channel: presence key → metadata entries.
pub type PresenceState = HashMap<String, Vec<Value>>;

/// Lifecycle status of one channel subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The relay confirmed the subscription.
    Subscribed,
    /// The relay reported an error for the channel.
    ChannelError(String),
    /// The relay gave up waiting on the subscription.
    TimedOut,
    /// The channel (or the whole socket) closed.
    Closed,
}

/// Event delivered on a subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayEvent {
    /// Subscription status change.
    Status(ChannelStatus),
    /// A payload broadcast on the channel by another participant.
    Broadcast(Value),
    /// Full presence state after a join or leave.
    Presence(PresenceState),
}

/// Receiving half of a subscription.
pub type Subscription = mpsc::UnboundedReceiver<RelayEvent>;

/// Relay failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay socket could not be opened.
    #[error("relay connect failed: {0}")]
    Connect(String),
    /// The relay socket is closed.
    #[error("relay connection closed")]
    Closed,
    /// The relay refused the operation.
    #[error("relay rejected {0}")]
    Rejected(String),
    /// No answer in time.
    #[error("relay timed out: {0}")]
    Timeout(String),
    /// Unexpected frame.
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

impl From<RelayError> for BridgeError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Timeout(what) => Self::Timeout(what),
            other => Self::Relay(other.to_string()),
        }
    }
}

/// Client handle onto the relay.
///
/// Each handle is one participant: broadcasts it sends are not delivered back
/// to its own subscriptions.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Subscribe to `channel`. Confirmation arrives asynchronously as
    /// [`ChannelStatus::Subscribed`] on the returned receiver.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, RelayError>;

    /// Broadcast `payload` to the other subscribers of `channel`.
    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), RelayError>;

    /// Track this participant on `channel`'s presence under `key`.
    async fn track(&self, channel: &str, key: &str, payload: Value) -> Result<(), RelayError>;

    /// Leave `channel`, dropping its subscription and presence.
    async fn unsubscribe(&self, channel: &str) -> Result<(), RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn timeouts_map_to_timeout_errors() {
        let e: BridgeError = RelayError::Timeout("join".into()).into();
        assert_matches!(e, BridgeError::Timeout(_));
        let e: BridgeError = RelayError::Closed.into();
        assert_matches!(e, BridgeError::Relay(_));
    }
}
