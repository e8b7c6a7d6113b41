//! Channel transport.
//!
//! Presents one session as two directional streams over the relay, adds
//! per-sender sequence numbers and best-effort persistence, and falls back
//! to local-only ("degraded") operation when the relay cannot be joined.
//!
//! Which channel is published on depends on the [`Endpoint`]: the daemon
//! publishes on `session-output-*` and listens on `session-input-*`, the
//! viewer the other way round. Both track presence on `session-presence-*`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use tether_core::channels::{PresenceKind, PresencePayload, SessionChannels};
use tether_core::errors::BridgeError;
use tether_core::ids::SessionId;
use tether_core::messages::{MessageBody, MessageType, RealtimeMessage};
use tether_core::models::StoredMessage;
use tether_store::BridgeStore;

use crate::health::HealthLink;
use crate::relay::{ChannelStatus, PresenceState, Relay, RelayEvent, Subscription};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Side of the bridge a transport serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// The machine running the AI session.
    Daemon,
    /// A remote viewer.
    Viewer,
}

impl Endpoint {
    fn publish_channel(self, channels: &SessionChannels) -> &str {
        match self {
            Self::Daemon => &channels.output,
            Self::Viewer => &channels.input,
        }
    }

    fn listen_channel(self, channels: &SessionChannels) -> &str {
        match self {
            Self::Daemon => &channels.input,
            Self::Viewer => &channels.output,
        }
    }

    /// Persisted types this side emits; its seq continues from their history.
    pub fn persisted_types(self) -> &'static [MessageType] {
        match self {
            Self::Daemon => &[MessageType::Output, MessageType::System],
            Self::Viewer => &[MessageType::Input],
        }
    }

    /// Key this side's seq mark is stored under.
    fn sender_key(self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Viewer => "viewer",
        }
    }

    fn presence_kind(self) -> PresenceKind {
        match self {
            Self::Daemon => PresenceKind::Cli,
            Self::Viewer => PresenceKind::Viewer,
        }
    }

    fn presence_key(self) -> String {
        match self {
            Self::Daemon => "cli".to_owned(),
            Self::Viewer => format!("viewer-{:08x}", rand::random::<u32>()),
        }
    }
}

/// Transport tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Budget for a channel subscription to be confirmed.
    pub subscribe_timeout: Duration,
    /// Write `input`/`output`/`system` messages to the store.
    pub persist: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: Duration::from_secs(10),
            persist: true,
        }
    }
}

/// Notifications published by a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// `connect()` finished; `realtime` is false in degraded mode.
    Connected {
        /// Whether the relay is in use.
        realtime: bool,
    },
    /// `disconnect()` finished.
    Disconnected,
    /// A message arrived from the other side.
    Message(RealtimeMessage),
    /// Session presence changed.
    Presence(PresenceState),
    /// The relay became unusable; the transport continues locally.
    Degraded {
        /// What went wrong.
        reason: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sequenced, persisted, degradable session link.
pub struct ChannelTransport {
    session_id: SessionId,
    endpoint: Endpoint,
    channels: SessionChannels,
    presence_key: String,
    relay: Arc<dyn Relay>,
    store: Arc<dyn BridgeStore>,
    config: TransportConfig,
    /// Serializes connect/send/disconnect. Held across seq assignment,
    /// persistence and publish so relay order equals seq order.
    link: Mutex<Option<Listener>>,
    connected: AtomicBool,
    realtime: Arc<AtomicBool>,
    seq: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
}

impl ChannelTransport {
    /// Transport for `session_id` on `endpoint`'s side.
    pub fn new(
        session_id: SessionId,
        endpoint: Endpoint,
        relay: Arc<dyn Relay>,
        store: Arc<dyn BridgeStore>,
        config: TransportConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            channels: SessionChannels::for_session(&session_id),
            presence_key: endpoint.presence_key(),
            session_id,
            endpoint,
            relay,
            store,
            config,
            link: Mutex::new(None),
            connected: AtomicBool::new(false),
            realtime: Arc::new(AtomicBool::new(false)),
            seq: AtomicU64::new(0),
            events,
        }
    }

    /// Session this transport serves.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Side of the bridge.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Channel names in use.
    pub fn channels(&self) -> &SessionChannels {
        &self.channels
    }

    /// Whether `connect()` has completed (degraded or not).
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether messages are published on the relay.
    pub fn is_realtime_enabled(&self) -> bool {
        self.realtime.load(Ordering::SeqCst)
    }

    /// Seq the next `send` will use.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst) + 1
    }

    /// Notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Join the session's channels. Never fails on relay problems: the
    /// transport enters degraded mode instead. Idempotent.
    #[instrument(skip(self), fields(session_id = %self.session_id, endpoint = ?self.endpoint))]
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let mut link = self.link.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.restore_seq().await;
        let realtime = self.join_channels(&mut link).await;

        self.connected.store(true, Ordering::SeqCst);
        info!(realtime, next_seq = self.next_seq(), "transport connected");
        let _ = self.events.send(TransportEvent::Connected { realtime });
        Ok(())
    }

    /// Stamp `body` with the next seq, persist it if it is a history type, and
    /// publish it unless degraded.
    pub async fn send(&self, body: MessageBody) -> Result<RealtimeMessage, BridgeError> {
        let _link = self.link.lock().await;
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let message = RealtimeMessage::new(body, seq);
        self.try_persist(&message).await;

        if self.is_realtime_enabled() {
            let channel = self.endpoint.publish_channel(&self.channels);
            if let Err(error) = self.relay.broadcast(channel, message.to_value()).await {
                warn!(%channel, seq, %error, "broadcast failed");
                metrics::counter!("bridge_broadcast_failures_total").increment(1);
            }
        } else {
            trace!(seq, message_type = %message.kind(), "relay disabled, not broadcasting");
        }
        metrics::counter!("bridge_messages_sent_total", "type" => message.kind().as_str())
            .increment(1);
        Ok(message)
    }

    /// Leave every channel and stop listening. Waits for an in-flight send.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let mut link = self.link.lock().await;
        if !self.is_connected() {
            return Ok(());
        }
        self.leave_channels(&mut link).await;
        self.connected.store(false, Ordering::SeqCst);
        info!("transport disconnected");
        let _ = self.events.send(TransportEvent::Disconnected);
        Ok(())
    }

    /// Leave and rejoin the relay channels. The link stays held throughout,
    /// so sends issued meanwhile wait and then go out on the new channels.
    /// Fails if the relay is still unusable; the transport stays connected
    /// in local-only mode either way.
    #[instrument(skip(self), fields(session_id = %self.session_id, endpoint = ?self.endpoint))]
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        let realtime = {
            let mut link = self.link.lock().await;
            if self.is_connected() {
                self.leave_channels(&mut link).await;
            } else {
                self.restore_seq().await;
            }
            let realtime = self.join_channels(&mut link).await;
            self.connected.store(true, Ordering::SeqCst);
            info!(realtime, next_seq = self.next_seq(), "transport rejoined");
            let _ = self.events.send(TransportEvent::Connected { realtime });
            realtime
        };
        if realtime {
            Ok(())
        } else {
            Err(BridgeError::Relay("relay still unavailable".into()))
        }
    }

    /// Subscribe to all three channels and start the listener. Returns
    /// whether the relay is usable; on failure the transport is degraded.
    async fn join_channels(&self, link: &mut Option<Listener>) -> bool {
        let listen = self.endpoint.listen_channel(&self.channels).to_owned();
        let publish = self.endpoint.publish_channel(&self.channels).to_owned();
        let (inbound, outbound, presence) = tokio::join!(
            self.join(&listen),
            self.join(&publish),
            self.join(&self.channels.presence),
        );

        match (inbound, outbound) {
            (Ok(inbound), Ok(outbound)) => {
                let presence = match presence {
                    Ok(sub) => {
                        self.track_presence().await;
                        Some(sub)
                    }
                    Err(reason) => {
                        warn!(channel = %self.channels.presence, %reason, "presence unavailable");
                        None
                    }
                };
                self.realtime.store(true, Ordering::SeqCst);
                *link = Some(self.spawn_listener(inbound, outbound, presence));
                true
            }
            (inbound, outbound) => {
                let reason = [inbound.err(), outbound.err()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("; ");
                self.release_channels().await;
                self.realtime.store(false, Ordering::SeqCst);
                warn!(%reason, "relay unavailable, continuing in local-only mode");
                let _ = self.events.send(TransportEvent::Degraded { reason });
                false
            }
        }
    }

    async fn leave_channels(&self, link: &mut Option<Listener>) {
        if let Some(listener) = link.take() {
            listener.cancel.cancel();
            let _ = listener.handle.await;
            self.release_channels().await;
        }
        self.realtime.store(false, Ordering::SeqCst);
    }

    /// Continue after the highest seq this side has used: persisted history
    /// or the high-water mark left by non-history sends.
    async fn restore_seq(&self) {
        let sender = self.endpoint.sender_key();
        let (history, mark) = tokio::join!(
            self.store.last_seq(&self.session_id, self.endpoint.persisted_types()),
            self.store.seq_mark(&self.session_id, sender),
        );
        for last in [history, mark] {
            match last {
                Ok(Some(last)) => {
                    let _ = self.seq.fetch_max(last, Ordering::SeqCst);
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "could not read last used seq"),
            }
        }
    }

    /// Best-effort write. History types become rows; everything else only
    /// raises this side's seq mark. Never fails the caller.
    async fn try_persist(&self, message: &RealtimeMessage) {
        if !self.config.persist {
            return;
        }
        match StoredMessage::from_message(&self.session_id, message) {
            Some(row) => match self.store.append_message(&row).await {
                Ok(()) => metrics::counter!("bridge_messages_persisted_total").increment(1),
                Err(error) => {
                    warn!(seq = message.seq, message_type = %message.kind(), %error, "failed to persist message");
                    metrics::counter!("bridge_persist_failures_total").increment(1);
                }
            },
            None => {
                if let Err(error) = self
                    .store
                    .mark_seq(&self.session_id, self.endpoint.sender_key(), message.seq)
                    .await
                {
                    debug!(seq = message.seq, %error, "seq mark not recorded");
                }
            }
        }
    }

    async fn join(&self, channel: &str) -> Result<Subscription, String> {
        let mut sub = self
            .relay
            .subscribe(channel)
            .await
            .map_err(|e| format!("{channel}: {e}"))?;
        match time::timeout(self.config.subscribe_timeout, wait_confirmed(&mut sub)).await {
            Ok(Ok(())) => {
                debug!(%channel, "subscribed");
                Ok(sub)
            }
            Ok(Err(reason)) => Err(format!("{channel}: {reason}")),
            Err(_) => Err(format!(
                "{channel}: not confirmed within {}ms",
                self.config.subscribe_timeout.as_millis()
            )),
        }
    }

    async fn track_presence(&self) {
        let payload = match serde_json::to_value(PresencePayload::now(self.endpoint.presence_kind())) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "could not encode presence payload");
                return;
            }
        };
        if let Err(error) = self
            .relay
            .track(&self.channels.presence, &self.presence_key, payload)
            .await
        {
            warn!(channel = %self.channels.presence, %error, "presence track failed");
        }
    }

    async fn release_channels(&self) {
        for channel in [
            &self.channels.input,
            &self.channels.output,
            &self.channels.presence,
        ] {
            if let Err(error) = self.relay.unsubscribe(channel).await {
                debug!(%channel, %error, "unsubscribe failed");
            }
        }
    }

    fn spawn_listener(
        &self,
        inbound: Subscription,
        outbound: Subscription,
        presence: Option<Subscription>,
    ) -> Listener {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen(
            inbound,
            outbound,
            presence,
            self.events.clone(),
            Arc::clone(&self.realtime),
            cancel.clone(),
        ));
        Listener { cancel, handle }
    }
}

#[async_trait]
impl HealthLink for ChannelTransport {
    async fn probe(&self) -> Result<(), BridgeError> {
        self.send(MessageBody::Ping).await.map(|_| ())
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        self.reconnect().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

async fn wait_confirmed(sub: &mut Subscription) -> Result<(), String> {
    while let Some(event) = sub.recv().await {
        match event {
            RelayEvent::Status(ChannelStatus::Subscribed) => return Ok(()),
            RelayEvent::Status(ChannelStatus::ChannelError(reason)) => return Err(reason),
            RelayEvent::Status(other) => return Err(format!("{other:?}")),
            RelayEvent::Broadcast(_) | RelayEvent::Presence(_) => {}
        }
    }
    Err("subscription dropped".into())
}

async fn next_event(sub: &mut Option<Subscription>) -> Option<RelayEvent> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Channel failure reason, or `None` if the event is benign.
fn failure(event: Option<&RelayEvent>) -> Option<String> {
    match event {
        None => Some("subscription dropped".into()),
        Some(RelayEvent::Status(ChannelStatus::Subscribed)) => None,
        Some(RelayEvent::Status(ChannelStatus::ChannelError(reason))) => Some(reason.clone()),
        Some(RelayEvent::Status(status)) => Some(format!("{status:?}")),
        Some(_) => None,
    }
}

async fn listen(
    mut inbound: Subscription,
    mut outbound: Subscription,
    mut presence: Option<Subscription>,
    events: broadcast::Sender<TransportEvent>,
    realtime: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            event = inbound.recv() => {
                if let Some(RelayEvent::Broadcast(value)) = &event {
                    match RealtimeMessage::parse(value) {
                        Some(message) => {
                            trace!(seq = message.seq, message_type = %message.kind(), "received");
                            let _ = events.send(TransportEvent::Message(message));
                        }
                        None => {
                            metrics::counter!("bridge_messages_dropped_total", "reason" => "unparseable")
                                .increment(1);
                        }
                    }
                } else if let Some(reason) = failure(event.as_ref()) {
                    break reason;
                }
            }
            event = outbound.recv() => {
                if let Some(reason) = failure(event.as_ref()) {
                    break reason;
                }
            }
            event = next_event(&mut presence) => match event {
                Some(RelayEvent::Presence(state)) => {
                    let _ = events.send(TransportEvent::Presence(state));
                }
                Some(_) => {}
                None => presence = None,
            },
        }
    };
    realtime.store(false, Ordering::SeqCst);
    warn!(%reason, "relay channel lost, continuing in local-only mode");
    let _ = events.send(TransportEvent::Degraded { reason });
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::memory_relay::MemoryRelay;
    use assert_matches::assert_matches;
    use tether_store::MemoryStore;

    fn transport(relay: &MemoryRelay, store: &Arc<MemoryStore>, endpoint: Endpoint) -> ChannelTransport {
        ChannelTransport::new(
            SessionId::from("s1"),
            endpoint,
            Arc::new(relay.client()),
            store.clone(),
            TransportConfig::default(),
        )
    }

    #[tokio::test]
    async fn send_before_connect_is_misuse_and_keeps_seq() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let t = transport(&relay, &store, Endpoint::Viewer);

        let err = t.send(MessageBody::input("hi")).await.unwrap_err();
        assert_matches!(err, BridgeError::NotConnected);
        assert!(err.is_misuse());
        assert_eq!(t.next_seq(), 1);
    }

    #[tokio::test]
    async fn seq_advances_by_one_per_send() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();
        assert!(t.is_realtime_enabled());

        for expected in 1..=5 {
            let sent = t.send(MessageBody::output("x")).await.unwrap();
            assert_eq!(sent.seq, expected);
        }
        let seqs: Vec<u64> = relay
            .published("session-output-s1")
            .iter()
            .filter_map(|v| v["seq"].as_u64())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn only_history_types_are_persisted() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();

        t.send(MessageBody::output("a")).await.unwrap();
        t.send(MessageBody::Ping).await.unwrap();
        t.send(MessageBody::system("b")).await.unwrap();

        let rows = store.list_messages(&SessionId::from("s1"), None).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_send() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();

        let sent = t.send(MessageBody::output("x")).await.unwrap();
        assert_eq!(sent.seq, 1);
        assert_eq!(relay.published("session-output-s1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_subscription_degrades_but_keeps_working() {
        let relay = MemoryRelay::new();
        relay.set_never_confirm(true);
        let store = Arc::new(MemoryStore::new());
        let t = transport(&relay, &store, Endpoint::Daemon);
        let mut events = t.subscribe();

        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert!(!t.is_realtime_enabled());
        assert_matches!(events.recv().await.unwrap(), TransportEvent::Degraded { .. });
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Connected { realtime: false }
        );

        let sent = t.send(MessageBody::output("local")).await.unwrap();
        assert_eq!(sent.seq, 1);
        assert!(relay.published("session-output-s1").is_empty());
        assert_eq!(
            store.list_messages(&SessionId::from("s1"), None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn seq_continues_from_persisted_history() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        {
            let t = transport(&relay, &store, Endpoint::Daemon);
            t.connect().await.unwrap();
            for _ in 0..3 {
                t.send(MessageBody::output("x")).await.unwrap();
            }
            t.disconnect().await.unwrap();
        }

        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();
        assert_eq!(t.send(MessageBody::output("y")).await.unwrap().seq, 4);

        let viewer = transport(&relay, &store, Endpoint::Viewer);
        viewer.connect().await.unwrap();
        assert_eq!(viewer.next_seq(), 1);
    }

    #[tokio::test]
    async fn messages_flow_between_endpoints() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let daemon = transport(&relay, &store, Endpoint::Daemon);
        let viewer = transport(&relay, &store, Endpoint::Viewer);
        daemon.connect().await.unwrap();
        viewer.connect().await.unwrap();
        let mut daemon_events = daemon.subscribe();
        let mut viewer_events = viewer.subscribe();

        viewer.send(MessageBody::input("hello")).await.unwrap();
        daemon.send(MessageBody::output("hi there")).await.unwrap();

        let received = loop {
            if let TransportEvent::Message(m) = daemon_events.recv().await.unwrap() {
                break m;
            }
        };
        assert_eq!(received.content(), Some("hello"));
        let received = loop {
            if let TransportEvent::Message(m) = viewer_events.recv().await.unwrap() {
                break m;
            }
        };
        assert_eq!(received.content(), Some("hi there"));
    }

    #[tokio::test]
    async fn channel_loss_degrades_and_reconnect_restores() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();
        let mut events = t.subscribe();

        relay.close_channel("session-input-s1");
        loop {
            if let TransportEvent::Degraded { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(!t.is_realtime_enabled());
        assert!(t.is_connected());

        t.reconnect().await.unwrap();
        assert!(t.is_realtime_enabled());
    }

    #[tokio::test]
    async fn disconnect_releases_channels() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();
        assert_eq!(relay.subscriber_count("session-input-s1"), 1);
        assert!(relay.presence("session-presence-s1").contains_key("cli"));

        t.disconnect().await.unwrap();
        assert_eq!(relay.subscriber_count("session-input-s1"), 0);
        assert_eq!(relay.subscriber_count("session-output-s1"), 0);
        assert!(relay.presence("session-presence-s1").is_empty());
        assert_matches!(
            t.send(MessageBody::output("late")).await,
            Err(BridgeError::NotConnected)
        );
    }

    #[tokio::test]
    async fn seq_continues_past_unpersisted_sends_after_restart() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        {
            let t = transport(&relay, &store, Endpoint::Daemon);
            t.connect().await.unwrap();
            t.send(MessageBody::output("x")).await.unwrap();
            assert_eq!(t.send(MessageBody::Ping).await.unwrap().seq, 2);
            t.disconnect().await.unwrap();
        }

        let t = transport(&relay, &store, Endpoint::Daemon);
        t.connect().await.unwrap();
        let ping = t.send(MessageBody::Ping).await.unwrap();
        assert_eq!(ping.seq, 3);
    }

    #[tokio::test]
    async fn send_queued_behind_reconnect_is_delivered() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let t = Arc::new(transport(&relay, &store, Endpoint::Daemon));
        t.connect().await.unwrap();

        let held = t.link.lock().await;
        let rejoin = tokio::spawn({
            let t = Arc::clone(&t);
            async move { t.reconnect().await }
        });
        tokio::task::yield_now().await;
        let send = tokio::spawn({
            let t = Arc::clone(&t);
            async move { t.send(MessageBody::output("mid-reconnect")).await }
        });
        tokio::task::yield_now().await;
        drop(held);

        rejoin.await.unwrap().unwrap();
        let sent = send.await.unwrap().unwrap();
        assert_eq!(sent.seq, 1);
        assert!(t.is_connected());
        assert!(t.is_realtime_enabled());
        assert_eq!(relay.published("session-output-s1").len(), 1);
        assert_eq!(
            store.list_messages(&SessionId::from("s1"), None).await.unwrap().len(),
            1
        );
    }
}
