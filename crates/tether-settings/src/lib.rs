//! # tether-settings
//!
//! Configuration for the bridge daemon, and the settings-store collaborator it
//! edits on behalf of remote viewers.
//!
//! Bridge configuration is loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **User file**: `~/.tether/bridge.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! The settings store ([`SettingsStore`]) is a separate JSON document owned by
//! the AI tool; [`InteractiveCatalog`] describes and validates the forms that
//! edit it.

#![deny(unsafe_code)]

pub mod errors;
pub mod interactive;
pub mod loader;
pub mod store;
pub mod types;

pub use errors::{Result, SettingsError};
pub use interactive::{AppliedChange, InteractiveCatalog};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use store::{FileSettingsStore, MemorySettingsStore, SettingsStore};
pub use types::*;
