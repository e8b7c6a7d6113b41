//! # tether-core
//!
//! Foundation types for the session bridge.
//!
//! - **IDs**: branded newtypes for sessions, machines and users
//! - **Messages**: the closed wire catalog and the `RealtimeMessage` envelope
//! - **Message log**: receiver-side dedup and merge
//! - **Channels**: channel naming and presence payloads
//! - **Models**: persisted sessions, machines, history rows, conversation turns
//! - **Errors**: `BridgeError` and its recovery taxonomy
//! - **Retry**: reconnect backoff math
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod channels;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod message_log;
pub mod messages;
pub mod models;
pub mod retry;

pub use errors::{BridgeError, ErrorCategory};
pub use ids::{MachineId, SessionId, UserId};
pub use messages::{MessageBody, MessageType, RealtimeMessage};
