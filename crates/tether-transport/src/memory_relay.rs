//! In-process relay.
//!
//! [`MemoryRelay`] is the shared hub; [`MemoryRelay::client`] hands out one
//! [`MemoryRelayClient`] per participant. Faults can be injected to exercise
//! degraded mode and broadcast failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::relay::{ChannelStatus, PresenceState, Relay, RelayError, RelayEvent, Subscription};

type ClientId = u64;

struct Subscriber {
    client: ClientId,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct Faults {
    never_confirm: bool,
    reject_subscribe: bool,
    fail_broadcast: bool,
}

#[derive(Default)]
struct Hub {
    channels: HashMap<String, Vec<Subscriber>>,
    presence: HashMap<String, HashMap<String, (ClientId, Value)>>,
    published: HashMap<String, Vec<Value>>,
    faults: Faults,
}

impl Hub {
    fn presence_state(&self, channel: &str) -> PresenceState {
        self.presence
            .get(channel)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, (_, meta))| (key.clone(), vec![meta.clone()]))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify_presence(&mut self, channel: &str) {
        let state = self.presence_state(channel);
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.retain(|s| s.tx.send(RelayEvent::Presence(state.clone())).is_ok());
        }
    }
}

/// Shared in-memory relay hub.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryRelay {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// New participant handle.
    pub fn client(&self) -> MemoryRelayClient {
        MemoryRelayClient {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            hub: Arc::clone(&self.hub),
        }
    }

    /// Subscriptions are registered but never confirmed.
    pub fn set_never_confirm(&self, on: bool) {
        self.hub.lock().faults.never_confirm = on;
    }

    /// Subscriptions report a channel error.
    pub fn set_reject_subscribe(&self, on: bool) {
        self.hub.lock().faults.reject_subscribe = on;
    }

    /// Broadcasts fail.
    pub fn set_fail_broadcast(&self, on: bool) {
        self.hub.lock().faults.fail_broadcast = on;
    }

    /// Every payload successfully broadcast on `channel`.
    pub fn published(&self, channel: &str) -> Vec<Value> {
        self.hub
            .lock()
            .published
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub.lock().channels.get(channel).map_or(0, Vec::len)
    }

    /// Current presence state of `channel`.
    pub fn presence(&self, channel: &str) -> PresenceState {
        self.hub.lock().presence_state(channel)
    }

    /// Close `channel` for every subscriber, as a relay outage would.
    pub fn close_channel(&self, channel: &str) {
        let mut hub = self.hub.lock();
        if let Some(subs) = hub.channels.remove(channel) {
            for sub in subs {
                let _ = sub.tx.send(RelayEvent::Status(ChannelStatus::Closed));
            }
        }
        let _ = hub.presence.remove(channel);
    }
}

/// One participant on a [`MemoryRelay`].
pub struct MemoryRelayClient {
    id: ClientId,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl Relay for MemoryRelayClient {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.hub.lock();
        if hub.faults.reject_subscribe {
            let _ = tx.send(RelayEvent::Status(ChannelStatus::ChannelError(
                "subscription rejected".into(),
            )));
            return Ok(rx);
        }
        if !hub.faults.never_confirm {
            let _ = tx.send(RelayEvent::Status(ChannelStatus::Subscribed));
            let state = hub.presence_state(channel);
            if !state.is_empty() {
                let _ = tx.send(RelayEvent::Presence(state));
            }
        }
        let subs = hub.channels.entry(channel.to_owned()).or_default();
        subs.retain(|s| s.client != self.id);
        subs.push(Subscriber {
            client: self.id,
            tx,
        });
        Ok(rx)
    }

    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), RelayError> {
        let mut hub = self.hub.lock();
        if hub.faults.fail_broadcast {
            return Err(RelayError::Rejected(format!("broadcast on {channel}")));
        }
        hub.published
            .entry(channel.to_owned())
            .or_default()
            .push(payload.clone());
        if let Some(subs) = hub.channels.get_mut(channel) {
            subs.retain(|s| {
                s.client == self.id || s.tx.send(RelayEvent::Broadcast(payload.clone())).is_ok()
            });
        }
        Ok(())
    }

    async fn track(&self, channel: &str, key: &str, payload: Value) -> Result<(), RelayError> {
        let mut hub = self.hub.lock();
        let _ = hub
            .presence
            .entry(channel.to_owned())
            .or_default()
            .insert(key.to_owned(), (self.id, payload));
        hub.notify_presence(channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), RelayError> {
        let mut hub = self.hub.lock();
        if let Some(subs) = hub.channels.get_mut(channel) {
            subs.retain(|s| s.client != self.id);
        }
        let had_presence = hub.presence.get_mut(channel).is_some_and(|entries| {
            let before = entries.len();
            entries.retain(|_, (client, _)| *client != self.id);
            entries.len() != before
        });
        if had_presence {
            hub.notify_presence(channel);
        }
        Ok(())
    }
}

impl Drop for MemoryRelayClient {
    fn drop(&mut self) {
        let mut hub = self.hub.lock();
        for subs in hub.channels.values_mut() {
            subs.retain(|s| s.client != self.id);
        }
        let channels: Vec<String> = hub
            .presence
            .iter_mut()
            .filter_map(|(channel, entries)| {
                let before = entries.len();
                entries.retain(|_, (client, _)| *client != self.id);
                (entries.len() != before).then(|| channel.clone())
            })
            .collect();
        for channel in channels {
            hub.notify_presence(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_confirms_and_broadcast_skips_sender() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        let b = relay.client();
        let mut rx_a = a.subscribe("c").await.unwrap();
        let mut rx_b = b.subscribe("c").await.unwrap();
        assert_eq!(rx_a.recv().await, Some(RelayEvent::Status(ChannelStatus::Subscribed)));
        assert_eq!(rx_b.recv().await, Some(RelayEvent::Status(ChannelStatus::Subscribed)));

        a.broadcast("c", json!({"n": 1})).await.unwrap();
        assert_eq!(rx_b.recv().await, Some(RelayEvent::Broadcast(json!({"n": 1}))));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(relay.published("c"), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn faults_are_injectable() {
        let relay = MemoryRelay::new();
        let c = relay.client();

        relay.set_never_confirm(true);
        let mut rx = c.subscribe("quiet").await.unwrap();
        assert!(rx.try_recv().is_err());
        relay.set_never_confirm(false);

        relay.set_reject_subscribe(true);
        let mut rx = c.subscribe("bad").await.unwrap();
        assert_matches!(
            rx.recv().await,
            Some(RelayEvent::Status(ChannelStatus::ChannelError(_)))
        );
        relay.set_reject_subscribe(false);

        relay.set_fail_broadcast(true);
        assert_matches!(c.broadcast("x", json!(1)).await, Err(RelayError::Rejected(_)));
        assert!(relay.published("x").is_empty());
    }

    #[tokio::test]
    async fn presence_tracks_and_clears_on_drop() {
        let relay = MemoryRelay::new();
        let watcher = relay.client();
        let mut rx = watcher.subscribe("p").await.unwrap();
        let _ = rx.recv().await;

        {
            let daemon = relay.client();
            daemon.track("p", "m1", json!({"type": "cli"})).await.unwrap();
            let Some(RelayEvent::Presence(state)) = rx.recv().await else {
                panic!("expected presence");
            };
            assert!(state.contains_key("m1"));
        }

        let Some(RelayEvent::Presence(state)) = rx.recv().await else {
            panic!("expected presence");
        };
        assert!(state.is_empty());
        assert!(relay.presence("p").is_empty());
    }

    #[tokio::test]
    async fn close_channel_notifies_subscribers() {
        let relay = MemoryRelay::new();
        let c = relay.client();
        let mut rx = c.subscribe("c").await.unwrap();
        let _ = rx.recv().await;
        relay.close_channel("c");
        assert_eq!(rx.recv().await, Some(RelayEvent::Status(ChannelStatus::Closed)));
        assert_eq!(relay.subscriber_count("c"), 0);
    }
}
