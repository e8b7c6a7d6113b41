//! Websocket client for the hosted relay.
//!
//! Speaks the Phoenix channel protocol (`vsn=1.0.0`, JSON object frames) the
//! way the hosted realtime service expects it:
//!
//! - `phx_join` on `realtime:{channel}`, answered by a `phx_reply` carrying the
//!   same `ref`;
//! - `broadcast` frames wrapping `{type: "broadcast", event: "message", payload}`;
//! - `presence` track frames, `presence_state` / `presence_diff` updates;
//! - a `heartbeat` on the `phoenix` topic.
//!
//! One handler task owns the socket; [`WsRelay`] talks to it over a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::relay::{ChannelStatus, PresenceState, Relay, RelayError, RelayEvent, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PHOENIX_TOPIC: &str = "phoenix";
const TOPIC_PREFIX: &str = "realtime:";
const BROADCAST_EVENT: &str = "message";

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel topic, e.g. `realtime:session-output-abc`.
    pub topic: String,
    /// Protocol event, e.g. `phx_join`.
    pub event: String,
    /// Event payload.
    pub payload: Value,
    /// Correlation ref; replies echo it.
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    fn new(topic: impl Into<String>, event: &str, payload: Value, reference: u64) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_owned(),
            payload,
            reference: Some(reference.to_string()),
        }
    }
}

/// Encode a frame as a text message body.
pub fn encode_frame(frame: &Frame) -> Result<String, RelayError> {
    serde_json::to_string(frame).map_err(|e| RelayError::Protocol(e.to_string()))
}

/// Decode a text message body.
pub fn decode_frame(text: &str) -> Result<Frame, RelayError> {
    serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
}

fn topic_for(channel: &str) -> String {
    format!("{TOPIC_PREFIX}{channel}")
}

fn join_payload() -> Value {
    json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": "" }
        }
    })
}

/// Apply a `presence_state` (full) or `presence_diff` payload to `state`.
///
/// Both use `{key: {metas: [...]}}` maps; a diff carries `joins` and `leaves`.
/// Leaving metas are matched by `phx_ref`.
pub fn apply_presence(state: &mut PresenceState, event: &str, payload: &Value) {
    match event {
        "presence_state" => {
            state.clear();
            merge_joins(state, payload);
        }
        "presence_diff" => {
            if let Some(leaves) = payload.get("leaves").and_then(Value::as_object) {
                for (key, entry) in leaves {
                    let refs: Vec<&Value> = metas(entry)
                        .iter()
                        .filter_map(|m| m.get("phx_ref"))
                        .collect();
                    let now_empty = state.get_mut(key).is_some_and(|current| {
                        if refs.is_empty() {
                            current.clear();
                        } else {
                            current.retain(|m| m.get("phx_ref").is_none_or(|r| !refs.contains(&r)));
                        }
                        current.is_empty()
                    });
                    if now_empty {
                        let _ = state.remove(key);
                    }
                }
            }
            if let Some(joins) = payload.get("joins") {
                merge_joins(state, joins);
            }
        }
        _ => {}
    }
}

fn metas(entry: &Value) -> &[Value] {
    entry
        .get("metas")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn merge_joins(state: &mut PresenceState, joins: &Value) {
    if let Some(joins) = joins.as_object() {
        for (key, entry) in joins {
            state
                .entry(key.clone())
                .or_default()
                .extend(metas(entry).iter().cloned());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    Join {
        channel: String,
        tx: mpsc::UnboundedSender<RelayEvent>,
    },
    Push {
        channel: String,
        event: &'static str,
        payload: Value,
    },
    Leave {
        channel: String,
    },
}

struct Envelope {
    command: Command,
    done: oneshot::Sender<Result<(), RelayError>>,
}

/// Websocket relay client. One instance is one participant.
pub struct WsRelay {
    cmd_tx: mpsc::Sender<Envelope>,
    _handler: JoinHandle<()>,
}

impl WsRelay {
    /// Open the socket. `url` is the realtime endpoint, e.g.
    /// `wss://example.supabase.co/realtime/v1`.
    pub async fn connect(
        url: &str,
        api_key: &str,
        heartbeat_interval: Duration,
    ) -> Result<Self, RelayError> {
        let ws_url = format!(
            "{}/websocket?apikey={api_key}&vsn=1.0.0",
            url.trim_end_matches('/')
        );
        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        info!(url, "relay socket open");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handler = tokio::spawn(relay_handler_loop(ws, cmd_rx, heartbeat_interval));
        Ok(Self {
            cmd_tx,
            _handler: handler,
        })
    }

    async fn request(&self, command: Command) -> Result<(), RelayError> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Envelope { command, done })
            .await
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(Command::Join {
            channel: channel.to_owned(),
            tx,
        })
        .await?;
        Ok(rx)
    }

    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), RelayError> {
        self.request(Command::Push {
            channel: channel.to_owned(),
            event: "broadcast",
            payload: json!({ "type": "broadcast", "event": BROADCAST_EVENT, "payload": payload }),
        })
        .await
    }

    // Presence keys are assigned from the join config; `key` is informational.
    async fn track(&self, channel: &str, key: &str, payload: Value) -> Result<(), RelayError> {
        trace!(%channel, key, "tracking presence");
        self.request(Command::Push {
            channel: channel.to_owned(),
            event: "presence",
            payload: json!({ "type": "presence", "event": "track", "payload": payload }),
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), RelayError> {
        self.request(Command::Leave {
            channel: channel.to_owned(),
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler loop
// ─────────────────────────────────────────────────────────────────────────────

struct Joined {
    tx: mpsc::UnboundedSender<RelayEvent>,
    presence: PresenceState,
}

struct HandlerState {
    joined: HashMap<String, Joined>,
    /// Join ref → topic, until the `phx_reply` arrives.
    pending_joins: HashMap<String, String>,
    next_ref: AtomicU64,
}

impl HandlerState {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    fn frame_for(&mut self, command: Command) -> Option<Frame> {
        let reference = self.next_ref();
        match command {
            Command::Join { channel, tx } => {
                let topic = topic_for(&channel);
                let _ = self.pending_joins.insert(reference.to_string(), topic.clone());
                let _ = self.joined.insert(
                    topic.clone(),
                    Joined {
                        tx,
                        presence: PresenceState::new(),
                    },
                );
                Some(Frame::new(topic, "phx_join", join_payload(), reference))
            }
            Command::Push {
                channel,
                event,
                payload,
            } => Some(Frame::new(topic_for(&channel), event, payload, reference)),
            Command::Leave { channel } => {
                let topic = topic_for(&channel);
                self.joined
                    .remove(&topic)
                    .map(|_| Frame::new(topic, "phx_leave", json!({}), reference))
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if frame.event == "phx_reply" {
            let Some(topic) = frame
                .reference
                .as_ref()
                .and_then(|r| self.pending_joins.remove(r))
            else {
                return;
            };
            let status = match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => ChannelStatus::Subscribed,
                _ => ChannelStatus::ChannelError(
                    frame
                        .payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .unwrap_or("join rejected")
                        .to_owned(),
                ),
            };
            self.notify(&topic, RelayEvent::Status(status));
            return;
        }

        let Some(joined) = self.joined.get_mut(&frame.topic) else {
            trace!(topic = %frame.topic, event = %frame.event, "frame for unknown topic");
            return;
        };
        match frame.event.as_str() {
            "broadcast" => {
                let payload = frame.payload.get("payload").cloned().unwrap_or(Value::Null);
                let _ = joined.tx.send(RelayEvent::Broadcast(payload));
            }
            "presence_state" | "presence_diff" => {
                apply_presence(&mut joined.presence, &frame.event, &frame.payload);
                let _ = joined.tx.send(RelayEvent::Presence(joined.presence.clone()));
            }
            "phx_error" => {
                let _ = joined.tx.send(RelayEvent::Status(ChannelStatus::ChannelError(
                    "channel crashed".into(),
                )));
            }
            "phx_close" => {
                if let Some(joined) = self.joined.remove(&frame.topic) {
                    let _ = joined.tx.send(RelayEvent::Status(ChannelStatus::Closed));
                }
            }
            "system" => {
                if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                    let reason = frame
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("system error")
                        .to_owned();
                    let _ = joined
                        .tx
                        .send(RelayEvent::Status(ChannelStatus::ChannelError(reason)));
                }
            }
            other => trace!(event = other, "ignoring frame"),
        }
    }

    fn notify(&self, topic: &str, event: RelayEvent) {
        if let Some(joined) = self.joined.get(topic) {
            let _ = joined.tx.send(event);
        }
    }

    fn close_all(&mut self) {
        for (_, joined) in self.joined.drain() {
            let _ = joined.tx.send(RelayEvent::Status(ChannelStatus::Closed));
        }
    }
}

async fn relay_handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<Envelope>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut state = HandlerState {
        joined: HashMap::new(),
        pending_joins: HashMap::new(),
        next_ref: AtomicU64::new(1),
    };
    let mut heartbeat = time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = cmd_rx.recv() => {
                let Some(Envelope { command, done }) = envelope else { break };
                let result = match state.frame_for(command) {
                    Some(frame) => match encode_frame(&frame) {
                        Ok(text) => ws_tx
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|_| RelayError::Closed),
                        Err(e) => Err(e),
                    },
                    None => Ok(()),
                };
                let closed = matches!(result, Err(RelayError::Closed));
                let _ = done.send(result);
                if closed {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => match decode_frame(text.as_str()) {
                        Ok(frame) => state.on_frame(frame),
                        Err(error) => debug!(%error, "undecodable relay frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                let frame = Frame::new(PHOENIX_TOPIC, "heartbeat", json!({}), state.next_ref());
                let Ok(text) = encode_frame(&frame) else { continue };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    warn!("relay socket closed");
    state.close_all();
}
