//! # tether-transport
//!
//! Everything between a session and the hosted relay.
//!
//! - **[`relay`]**: the narrow relay interface, with an in-process
//!   ([`memory_relay`]) and a websocket ([`ws_relay`]) implementation
//! - **[`transport`]**: sequenced, persisted, degradable session channels
//! - **[`dispatch`]**: typed message-to-handler routing
//! - **[`health`]**: heartbeat, liveness timeout and reconnect backoff
//! - **[`presence`]**: machine liveness derived from presence
//! - **[`viewer`]**: the remote side of a session

#![deny(unsafe_code)]

pub mod dispatch;
pub mod health;
pub mod memory_relay;
pub mod presence;
pub mod relay;
pub mod transport;
pub mod viewer;
pub mod ws_relay;

pub use dispatch::{HandlerId, MessageDispatcher};
pub use health::{ConnectionHealthMonitor, ConnectionState, HealthConfig, HealthEvent, HealthLink};
pub use memory_relay::{MemoryRelay, MemoryRelayClient};
pub use presence::{MachinePresence, MachineWatch, is_machine_online};
pub use relay::{ChannelStatus, PresenceState, Relay, RelayError, RelayEvent};
pub use transport::{ChannelTransport, Endpoint, TransportConfig, TransportEvent};
pub use viewer::ViewerSession;
pub use ws_relay::WsRelay;
