//! # tether-store
//!
//! Durable storage for the session bridge: machines, sessions and the
//! persisted `input`/`output`/`system` history used for replay.
//!
//! [`BridgeStore`] is the interface the transport and orchestrator depend on.
//! [`SqliteStore`] is the production backend; [`MemoryStore`] backs tests and
//! local-only runs.

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use errors::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::BridgeStore;
