//! Message dispatch registry.
//!
//! Maps a message's [`MessageType`] to an ordered list of handlers, and always
//! emits the message on a generic event stream afterwards. Used the same way
//! on the daemon and the viewer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tether_core::messages::{MessageType, RealtimeMessage};

/// Capacity of the generic event stream.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Callback invoked for a dispatched message.
pub type Handler = Arc<dyn Fn(&RealtimeMessage) + Send + Sync>;

/// Identity of a registered handler, used for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Typed message dispatcher.
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<MessageType, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<RealtimeMessage>,
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Register `handler` for `kind`. Handlers run in registration order.
    pub fn register_handler<F>(&self, kind: MessageType, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove the handler registered as `id`. Returns whether it existed.
    pub fn remove_handler(&self, kind: MessageType, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = handlers.remove(&kind);
        }
        removed
    }

    /// Drop the handlers of `kind`, or of every type when `None`.
    pub fn clear_handlers(&self, kind: Option<MessageType>) {
        let mut handlers = self.handlers.write();
        match kind {
            Some(kind) => {
                let _ = handlers.remove(&kind);
            }
            None => handlers.clear(),
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: MessageType) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Run the handlers of `message.kind()` in order, then emit the generic
    /// event.
    pub fn handle_message(&self, message: &RealtimeMessage) {
        // Snapshot so handlers may (de)register without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&message.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(
            message_type = %message.kind(),
            seq = message.seq,
            handlers = handlers.len(),
            "dispatching message"
        );
        for handler in &handlers {
            handler(message);
        }
        let _ = self.events.send(message.clone());
    }

    /// Parse and dispatch a raw payload. Unknown types and malformed payloads
    /// are ignored; returns whether anything was dispatched.
    pub fn handle_value(&self, value: &Value) -> bool {
        match RealtimeMessage::parse(value) {
            Some(message) => {
                self.handle_message(&message);
                true
            }
            None => {
                debug!("dropping unknown message");
                metrics::counter!("bridge_messages_dropped_total", "reason" => "unparseable")
                    .increment(1);
                false
            }
        }
    }

    /// Generic event stream of every dispatched message.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.events.subscribe()
    }

    /// Generic event stream filtered to `kind`.
    pub fn subscribe(&self, kind: MessageType) -> TypedReceiver {
        TypedReceiver {
            kind,
            rx: self.events.subscribe(),
        }
    }
}

/// Generic event stream filtered to one message type.
pub struct TypedReceiver {
    kind: MessageType,
    rx: broadcast::Receiver<RealtimeMessage>,
}

impl TypedReceiver {
    /// Next message of this receiver's type. `None` once the dispatcher is
    /// gone. Lagged messages are skipped.
    pub async fn recv(&mut self) -> Option<RealtimeMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.kind() == self.kind => return Some(message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, message_type = %self.kind, "typed receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use tether_core::messages::MessageBody;

    fn output(seq: u64) -> RealtimeMessage {
        RealtimeMessage::new(MessageBody::output(format!("chunk {seq}")), seq)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let calls = Arc::clone(&calls);
            let _ = dispatcher.register_handler(MessageType::Output, move |m| {
                calls.lock().push((name, m.seq));
            });
        }
        dispatcher.handle_message(&output(1));
        assert_eq!(*calls.lock(), vec![("a", 1), ("b", 1), ("c", 1)]);
    }

    #[test]
    fn removal_is_by_identity() {
        let dispatcher = MessageDispatcher::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h1 = {
            let hits = Arc::clone(&hits);
            dispatcher.register_handler(MessageType::Output, move |_| hits.lock().push(1))
        };
        let _h2 = {
            let hits = Arc::clone(&hits);
            dispatcher.register_handler(MessageType::Output, move |_| hits.lock().push(2))
        };

        assert!(dispatcher.remove_handler(MessageType::Output, h1));
        assert!(!dispatcher.remove_handler(MessageType::Output, h1));
        assert!(!dispatcher.remove_handler(MessageType::Input, h1));
        dispatcher.handle_message(&output(1));
        assert_eq!(*hits.lock(), vec![2]);
    }

    #[test]
    fn clear_handlers_by_type_or_all() {
        let dispatcher = MessageDispatcher::new();
        let _ = dispatcher.register_handler(MessageType::Output, |_| {});
        let _ = dispatcher.register_handler(MessageType::System, |_| {});
        dispatcher.clear_handlers(Some(MessageType::Output));
        assert_eq!(dispatcher.handler_count(MessageType::Output), 0);
        assert_eq!(dispatcher.handler_count(MessageType::System), 1);
        dispatcher.clear_handlers(None);
        assert_eq!(dispatcher.handler_count(MessageType::System), 0);
    }

    #[tokio::test]
    async fn generic_event_fires_without_handlers() {
        let dispatcher = MessageDispatcher::new();
        let mut all = dispatcher.subscribe_all();
        let mut systems = dispatcher.subscribe(MessageType::System);

        dispatcher.handle_message(&output(1));
        dispatcher.handle_message(&RealtimeMessage::new(MessageBody::system("ready"), 2));

        assert_eq!(all.recv().await.unwrap().seq, 1);
        assert_eq!(all.recv().await.unwrap().seq, 2);
        assert_eq!(systems.recv().await.unwrap().seq, 2);
    }

    #[test]
    fn unknown_types_are_ignored() {
        let dispatcher = MessageDispatcher::new();
        assert!(!dispatcher.handle_value(&json!({"type": "teleport", "seq": 1, "timestamp": 1})));
        assert!(dispatcher.handle_value(&json!({"type": "ping", "seq": 1, "timestamp": 1})));
    }

    #[test]
    fn handlers_may_deregister_while_dispatching() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let id = {
            let inner = Arc::downgrade(&dispatcher);
            let slot = Arc::clone(&slot);
            dispatcher.register_handler(MessageType::Ping, move |_| {
                if let (Some(id), Some(d)) = (slot.lock().take(), inner.upgrade()) {
                    let _ = d.remove_handler(MessageType::Ping, id);
                }
            })
        };
        *slot.lock() = Some(id);
        dispatcher.handle_message(&RealtimeMessage::new(MessageBody::Ping, 1));
        assert_eq!(dispatcher.handler_count(MessageType::Ping), 0);
    }
}
