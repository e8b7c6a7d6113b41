//! Connection health monitor.
//!
//! Owns the logical state of one link and is the only thing that mutates it:
//!
//! ```text
//! disconnected ──start──▶ connected ──timeout──▶ reconnecting ──ok──▶ connected
//!                                                      │
//!                                               retries exhausted
//!                                                      ▼
//!                                                disconnected
//! ```
//!
//! `stop()` returns to `disconnected` from anywhere. Every transition is
//! published as [`HealthEvent::StateChanged`]; nobody polls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::errors::BridgeError;
use tether_core::retry::BackoffPolicy;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The link a monitor keeps alive.
#[async_trait]
pub trait HealthLink: Send + Sync {
    /// Send a liveness probe. The answer arrives out of band and is reported
    /// through [`ConnectionHealthMonitor::on_liveness_signal`].
    async fn probe(&self) -> Result<(), BridgeError>;

    /// Re-establish the link.
    async fn connect(&self) -> Result<(), BridgeError>;
}

/// Logical connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, no work scheduled.
    Disconnected,
    /// Initial connect in progress.
    Connecting,
    /// Connected and live.
    Connected,
    /// Liveness lost; the retry loop is running.
    Reconnecting,
}

impl ConnectionState {
    /// Status string shown to users.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications published by the monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthEvent {
    /// State transition.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A reconnect attempt will run after `delay`.
    RetryScheduled {
        /// One-based attempt number.
        attempt: u32,
        /// Jittered delay before the attempt.
        delay: Duration,
    },
    /// A reconnect attempt succeeded.
    Reconnected,
    /// The retry budget is spent; the monitor stopped.
    MaxRetriesReached,
}

/// Monitor tunables.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// Time between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Maximum silence before the link is declared lost.
    pub liveness_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

struct Inner {
    state: ConnectionState,
    last_liveness: Instant,
    retry_count: u32,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<HealthEvent>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    fn transition(&self, to: ConnectionState) {
        let from = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.state, to)
        };
        if from != to {
            info!(%from, %to, "connection state changed");
            let _ = self.events.send(HealthEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }
}

/// Heartbeat, liveness timeout and reconnect loop for one link.
pub struct ConnectionHealthMonitor {
    config: HealthConfig,
    link: Arc<dyn HealthLink>,
    shared: Arc<Shared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionHealthMonitor {
    /// Monitor for `link`, initially disconnected.
    pub fn new(link: Arc<dyn HealthLink>, config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            link,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    last_liveness: Instant::now(),
                    retry_count: 0,
                }),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Reconnect attempts made since the link was last live.
    pub fn retry_count(&self) -> u32 {
        self.shared.inner.lock().retry_count
    }

    /// Notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.shared.events.subscribe()
    }

    /// Mark the initial connect as in progress.
    pub fn begin_connect(&self) {
        if self.state() == ConnectionState::Disconnected {
            self.shared.transition(ConnectionState::Connecting);
        }
    }

    /// Enter `connected`, stamp liveness and start the heartbeat.
    pub fn start(&self) {
        self.cancel_task();
        {
            let mut inner = self.shared.inner.lock();
            inner.last_liveness = Instant::now();
            inner.retry_count = 0;
        }
        self.shared.transition(ConnectionState::Connected);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&self.shared),
            Arc::clone(&self.link),
            self.config.clone(),
            cancel.clone(),
        ));
        *self.task.lock() = Some((cancel, handle));
        debug!(
            interval_ms = self.config.heartbeat_interval.as_millis(),
            timeout_ms = self.config.liveness_timeout.as_millis(),
            "heartbeat started"
        );
    }

    /// Record a liveness signal. Ends an in-progress reconnect.
    pub fn on_liveness_signal(&self) {
        let recovered = {
            let mut inner = self.shared.inner.lock();
            inner.last_liveness = Instant::now();
            if inner.state == ConnectionState::Reconnecting {
                inner.retry_count = 0;
                true
            } else {
                false
            }
        };
        if recovered {
            self.shared.transition(ConnectionState::Connected);
        }
    }

    /// Cancel the heartbeat and any retry loop and enter `disconnected`.
    pub fn stop(&self) {
        self.cancel_task();
        self.shared.inner.lock().retry_count = 0;
        self.shared.transition(ConnectionState::Disconnected);
    }

    fn cancel_task(&self) {
        if let Some((cancel, handle)) = self.task.lock().take() {
            cancel.cancel();
            drop(handle);
        }
    }
}

impl Drop for ConnectionHealthMonitor {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

async fn run_heartbeat(
    shared: Arc<Shared>,
    link: Arc<dyn HealthLink>,
    config: HealthConfig,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if shared.state() != ConnectionState::Connected {
            continue;
        }

        if let Err(error) = link.probe().await {
            debug!(%error, "liveness probe failed");
        }

        let silent_for = shared.inner.lock().last_liveness.elapsed();
        if silent_for <= config.liveness_timeout {
            continue;
        }
        warn!(
            silent_ms = silent_for.as_millis(),
            timeout_ms = config.liveness_timeout.as_millis(),
            "liveness timeout, reconnecting"
        );
        shared.transition(ConnectionState::Reconnecting);
        if !retry_loop(&shared, link.as_ref(), &config.backoff, &cancel).await {
            return;
        }
    }
}

/// Runs until the link is live again (`true`) or the monitor is done
/// (`false`).
async fn retry_loop(
    shared: &Shared,
    link: &dyn HealthLink,
    backoff: &BackoffPolicy,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let attempt = {
            let mut inner = shared.inner.lock();
            if inner.state != ConnectionState::Reconnecting {
                return inner.state == ConnectionState::Connected;
            }
            if inner.retry_count >= backoff.max_retries {
                None
            } else {
                inner.retry_count += 1;
                Some(inner.retry_count)
            }
        };
        let Some(attempt) = attempt else {
            warn!(max_retries = backoff.max_retries, "reconnect retries exhausted");
            shared.transition(ConnectionState::Disconnected);
            shared.emit(HealthEvent::MaxRetriesReached);
            return false;
        };

        let delay = backoff.delay_with_random(attempt - 1, rand::random::<f64>());
        info!(attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
        metrics::counter!("bridge_reconnect_attempts_total").increment(1);
        shared.emit(HealthEvent::RetryScheduled { attempt, delay });

        tokio::select! {
            () = cancel.cancelled() => return false,
            () = time::sleep(delay) => {}
        }
        if shared.state() != ConnectionState::Reconnecting {
            continue;
        }

        let result = tokio::select! {
            () = cancel.cancelled() => return false,
            r = link.connect() => r,
        };
        match result {
            Ok(()) => {
                {
                    let mut inner = shared.inner.lock();
                    inner.last_liveness = Instant::now();
                    inner.retry_count = 0;
                }
                shared.transition(ConnectionState::Connected);
                shared.emit(HealthEvent::Reconnected);
                info!(attempt, "reconnected");
                return true;
            }
            Err(error) => warn!(attempt, %error, "reconnect attempt failed"),
        }
    }
}
