//! Remote side of a session.
//!
//! [`ViewerSession`] replays persisted history, attaches a viewer transport,
//! keeps the deduplicated message list a UI renders, answers the daemon's
//! pings and routes everything through a [`MessageDispatcher`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::errors::BridgeError;
use tether_core::ids::SessionId;
use tether_core::message_log::MessageLog;
use tether_core::messages::{
    Attachment, InteractivePayload, MessageBody, MessageType, PermissionMode, RealtimeMessage,
};
use tether_store::BridgeStore;

use crate::dispatch::MessageDispatcher;
use crate::presence::is_machine_online;
use crate::relay::Relay;
use crate::transport::{ChannelTransport, Endpoint, TransportConfig, TransportEvent};

/// A viewer attached to one session.
pub struct ViewerSession {
    session_id: SessionId,
    transport: Arc<ChannelTransport>,
    dispatcher: Arc<MessageDispatcher>,
    log: Arc<Mutex<MessageLog>>,
    daemon_attached: Arc<AtomicBool>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ViewerSession {
    /// Replay history and attach to `session_id`.
    pub async fn open(
        session_id: SessionId,
        relay: Arc<dyn Relay>,
        store: Arc<dyn BridgeStore>,
        config: TransportConfig,
    ) -> Result<Self, BridgeError> {
        let mut log = MessageLog::new();
        match store.list_messages(&session_id, None).await {
            Ok(rows) => {
                let replayed = log.extend(rows.iter().filter_map(RealtimeMessage::from_stored));
                debug!(%session_id, replayed, "history replayed");
            }
            Err(error) => warn!(%session_id, %error, "history unavailable"),
        }

        let transport = Arc::new(ChannelTransport::new(
            session_id.clone(),
            Endpoint::Viewer,
            relay,
            store,
            config,
        ));
        let events = transport.subscribe();
        transport.connect().await?;

        let dispatcher = Arc::new(MessageDispatcher::new());
        let log = Arc::new(Mutex::new(log));
        let daemon_attached = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(
            events,
            Arc::clone(&transport),
            Arc::clone(&dispatcher),
            Arc::clone(&log),
            Arc::clone(&daemon_attached),
            cancel.clone(),
        ));
        info!(%session_id, realtime = transport.is_realtime_enabled(), "viewer attached");

        Ok(Self {
            session_id,
            transport,
            dispatcher,
            log,
            daemon_attached,
            cancel,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Session being viewed.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Dispatcher for UI handlers.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<ChannelTransport> {
        &self.transport
    }

    /// Snapshot of the message list, oldest first.
    pub fn messages(&self) -> Vec<RealtimeMessage> {
        self.log.lock().entries().to_vec()
    }

    /// Whether the daemon is present on the session.
    pub fn is_daemon_attached(&self) -> bool {
        self.daemon_attached.load(Ordering::SeqCst)
    }

    /// Send a message; history types also land in the local list.
    pub async fn send(&self, body: MessageBody) -> Result<RealtimeMessage, BridgeError> {
        let message = self.transport.send(body).await?;
        if message.kind().is_persisted() {
            let _ = self.log.lock().insert(message.clone());
        }
        Ok(message)
    }

    /// Send prompt text.
    pub async fn send_input(
        &self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::Input {
            content: content.into(),
            attachments,
        })
        .await
    }

    /// Ask for a permission mode change.
    pub async fn change_mode(&self, permission_mode: PermissionMode) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::ModeChange { permission_mode }).await
    }

    /// Ask for a model change.
    pub async fn change_model(&self, model: impl Into<String>) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::ModelChange { model: model.into() }).await
    }

    /// Ask for the model catalog.
    pub async fn request_models(&self) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::ModelsRequest).await
    }

    /// Ask for the supported command list.
    pub async fn request_commands(&self) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::CommandsRequest).await
    }

    /// Ask for an interactive form.
    pub async fn request_interactive(&self, command: impl Into<String>) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::InteractiveRequest {
            interactive_command: command.into(),
        })
        .await
    }

    /// Submit a form change.
    pub async fn apply_interactive(&self, payload: InteractivePayload) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::InteractiveApply {
            interactive_payload: payload,
        })
        .await
    }

    /// Probe the daemon.
    pub async fn ping(&self) -> Result<RealtimeMessage, BridgeError> {
        self.send(MessageBody::Ping).await
    }

    /// Detach from the session.
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.cancel.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.transport.disconnect().await
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(
    mut events: broadcast::Receiver<TransportEvent>,
    transport: Arc<ChannelTransport>,
    dispatcher: Arc<MessageDispatcher>,
    log: Arc<Mutex<MessageLog>>,
    daemon_attached: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Message(message)) => {
                match message.kind() {
                    MessageType::Ping => {
                        let pong = MessageBody::Pong { ping_seq: message.seq };
                        if let Err(error) = transport.send(pong).await {
                            debug!(%error, "pong not sent");
                        }
                    }
                    MessageType::Pong => {}
                    _ => {
                        if !log.lock().insert(message.clone()) {
                            debug!(seq = message.seq, message_type = %message.kind(), "duplicate dropped");
                            continue;
                        }
                    }
                }
                dispatcher.handle_message(&message);
            }
            Ok(TransportEvent::Presence(state)) => {
                daemon_attached.store(is_machine_online(&state), Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "viewer fell behind the transport");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::memory_relay::MemoryRelay;
    use chrono::Utc;
    use tether_core::models::StoredMessage;
    use tether_store::MemoryStore;

    async fn wait_for<F: Fn(&[RealtimeMessage]) -> bool>(viewer: &ViewerSession, pred: F) {
        for _ in 0..100 {
            if pred(viewer.messages().as_slice()) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", viewer.messages());
    }

    #[tokio::test]
    async fn history_replay_and_live_messages_are_deduplicated() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let sid = SessionId::from("s1");
        store
            .append_message(&StoredMessage {
                session_id: sid.clone(),
                kind: MessageType::Output,
                content: "earlier".into(),
                seq: 1,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let viewer = ViewerSession::open(sid.clone(), Arc::new(relay.client()), store.clone(), TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(viewer.messages().len(), 1);

        let daemon = ChannelTransport::new(
            sid.clone(),
            Endpoint::Daemon,
            Arc::new(relay.client()),
            Arc::new(MemoryStore::new()),
            TransportConfig::default(),
        );
        daemon.connect().await.unwrap();
        // Same (seq, type) as the replayed row, then a new one.
        daemon.send(MessageBody::output("earlier")).await.unwrap();
        daemon.send(MessageBody::output("later")).await.unwrap();

        wait_for(&viewer, |m| m.len() == 2).await;
        let contents: Vec<_> = viewer.messages().iter().filter_map(|m| m.content().map(str::to_owned)).collect();
        assert_eq!(contents, vec!["earlier", "later"]);
        for _ in 0..100 {
            if viewer.is_daemon_attached() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(viewer.is_daemon_attached());
    }

    #[tokio::test]
    async fn pings_are_answered_with_matching_pongs() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let sid = SessionId::from("s1");
        let viewer = ViewerSession::open(sid.clone(), Arc::new(relay.client()), store.clone(), TransportConfig::default())
            .await
            .unwrap();

        let daemon = ChannelTransport::new(
            sid,
            Endpoint::Daemon,
            Arc::new(relay.client()),
            store,
            TransportConfig::default(),
        );
        daemon.connect().await.unwrap();
        let mut events = daemon.subscribe();
        let ping = daemon.send(MessageBody::Ping).await.unwrap();

        let pong = loop {
            if let TransportEvent::Message(m) = events.recv().await.unwrap() {
                break m;
            }
        };
        assert_eq!(pong.body, MessageBody::Pong { ping_seq: ping.seq });
        assert!(viewer.messages().is_empty());
    }

    #[tokio::test]
    async fn own_input_is_listed_and_persisted() {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let sid = SessionId::from("s1");
        let viewer = ViewerSession::open(sid.clone(), Arc::new(relay.client()), store.clone(), TransportConfig::default())
            .await
            .unwrap();

        viewer.send_input("hello", Vec::new()).await.unwrap();
        viewer.request_models().await.unwrap();
        assert_eq!(viewer.messages().len(), 1);
        assert_eq!(store.list_messages(&sid, None).await.unwrap().len(), 1);
        assert_eq!(relay.published("session-input-s1").len(), 2);

        viewer.close().await.unwrap();
        assert!(viewer.send_input("late", Vec::new()).await.is_err());
    }
}
