//! Machine liveness via presence.
//!
//! A machine is online while its daemon is tracked on the machine presence
//! channel. Nothing polls the store for this.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use tether_core::channels::{PresenceKind, PresencePayload, machine_presence};
use tether_core::errors::BridgeError;
use tether_core::ids::MachineId;

use crate::relay::{PresenceState, Relay, RelayEvent, Subscription};

/// Whether `state` contains a daemon (`type: "cli"`) participant.
pub fn is_machine_online(state: &PresenceState) -> bool {
    state.values().flatten().any(|meta| {
        meta.get("type").and_then(Value::as_str) == Some(PresenceKind::Cli.as_str())
    })
}

/// The daemon's presence on its machine channel.
pub struct MachinePresence {
    relay: Arc<dyn Relay>,
    channel: String,
    machine_id: MachineId,
}

impl MachinePresence {
    /// Join the machine presence channel and track this daemon on it.
    pub async fn announce(relay: Arc<dyn Relay>, machine_id: MachineId) -> Result<Self, BridgeError> {
        let channel = machine_presence(&machine_id);
        let _sub = relay.subscribe(&channel).await?;
        let payload = serde_json::to_value(PresencePayload::now(PresenceKind::Cli))?;
        relay.track(&channel, machine_id.as_str(), payload).await?;
        info!(%machine_id, %channel, "machine presence announced");
        Ok(Self {
            relay,
            channel,
            machine_id,
        })
    }

    /// Channel the presence lives on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Leave the presence channel.
    pub async fn withdraw(self) {
        if let Err(error) = self.relay.unsubscribe(&self.channel).await {
            warn!(machine_id = %self.machine_id, %error, "presence withdraw failed");
        } else {
            debug!(machine_id = %self.machine_id, "machine presence withdrawn");
        }
    }
}

/// Viewer-side watcher of a machine's presence channel.
pub struct MachineWatch {
    sub: Subscription,
    online: bool,
}

impl MachineWatch {
    /// Subscribe to `machine_id`'s presence channel.
    pub async fn open(relay: &dyn Relay, machine_id: &MachineId) -> Result<Self, BridgeError> {
        let sub = relay.subscribe(&machine_presence(machine_id)).await?;
        Ok(Self { sub, online: false })
    }

    /// Last known liveness.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Wait for the next liveness change. `None` once the channel is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        while let Some(event) = self.sub.recv().await {
            if let RelayEvent::Presence(state) = event {
                let online = is_machine_online(&state);
                if online != self.online {
                    self.online = online;
                    return Some(online);
                }
            }
        }
        None
    }
}
