//! Connection state for a session channel and the manual reconnect protocol.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use codeclass_shared::{SessionEvent, SubscriptionStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::backend::RealtimeBackend;
use super::channel::{ChannelHandlers, EventHandler, OpenParams, PresenceHandler, SessionChannel};

pub const CHANNEL_ERROR_MESSAGE: &str = "Failed to connect to real-time server";
pub const TIMED_OUT_MESSAGE: &str = "Connection timed out";

/// Connection state for a session channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Observable status of a channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    pub is_reconnecting: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            error: None,
            reconnect_attempts: 0,
            is_reconnecting: false,
        }
    }
}

/// Outcome of asking for a manual reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    AlreadyReconnecting,
    Exhausted,
    Proceed { attempt: u32 },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn on_open(&mut self) {
        self.state = ConnectionState::Connecting;
        self.error = None;
    }

    pub fn on_subscription(&mut self, status: SubscriptionStatus) {
        match status {
            SubscriptionStatus::Subscribed => {
                self.state = ConnectionState::Connected;
                self.error = None;
                self.reconnect_attempts = 0;
                self.is_reconnecting = false;
            }
            SubscriptionStatus::ChannelError => {
                self.state = ConnectionState::Failed;
                self.error = Some(CHANNEL_ERROR_MESSAGE.to_string());
            }
            SubscriptionStatus::TimedOut => {
                self.state = ConnectionState::Failed;
                self.error = Some(TIMED_OUT_MESSAGE.to_string());
            }
            SubscriptionStatus::Closed => {
                self.state = ConnectionState::Disconnected;
            }
        }
    }

    /// Count a reconnect attempt against `config`.
    pub fn begin_reconnect(&mut self, config: &ReconnectConfig) -> ReconnectDecision {
        if self.is_reconnecting {
            return ReconnectDecision::AlreadyReconnecting;
        }
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > config.max_attempts {
            self.state = ConnectionState::Failed;
            self.error = Some(format!("Failed to reconnect after {} attempts", config.max_attempts));
            return ReconnectDecision::Exhausted;
        }
        self.is_reconnecting = true;
        self.state = ConnectionState::Connecting;
        ReconnectDecision::Proceed {
            attempt: self.reconnect_attempts,
        }
    }

    pub fn reset(&mut self) {
        *self = Self {
            state: ConnectionState::Disconnected,
            ..Self::default()
        };
    }
}

/// Configuration for manual reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts before giving up
    pub max_attempts: u32,
    /// Pause between tearing down the old channel and opening a new one, in milliseconds
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 500,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// A session channel plus the state machine that tracks it.
///
/// Broadcast events reach `on_event` only while the status is connected.
pub struct RealtimeConnection {
    channel: SessionChannel,
    params: OpenParams,
    config: ReconnectConfig,
    status: Arc<watch::Sender<ConnectionStatus>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeConnection {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        params: OpenParams,
        config: ReconnectConfig,
        on_event: EventHandler,
        on_presence: Option<PresenceHandler>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let status = Arc::new(status);

        let gate = status.clone();
        let gated_event: EventHandler = Arc::new(move |event: SessionEvent| {
            if gate.borrow().is_connected() {
                on_event(event);
            } else {
                crate::log_debug!("Dropping {} while not connected", event.name());
            }
        });

        let tracker = status.clone();
        let handlers = ChannelHandlers {
            on_event: gated_event,
            on_presence,
            on_status: Arc::new(move |status: SubscriptionStatus, reason: Option<String>| {
                if let Some(reason) = reason {
                    crate::log_debug!("Subscription {:?}: {}", status, reason);
                }
                tracker.send_modify(|s| s.on_subscription(status));
            }),
        };

        Arc::new(Self {
            channel: SessionChannel::new(backend, handlers),
            params,
            config,
            status,
            reconnect_task: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.params.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Open the channel. A no-op for an empty session id.
    pub async fn open(&self) {
        if self.params.session_id.is_empty() {
            return;
        }
        self.status.send_modify(ConnectionStatus::on_open);
        self.channel.open(&self.params).await;
    }

    /// Tear down and re-open the channel after a short pause.
    ///
    /// Ignored while a reconnect is already in flight. Past
    /// `max_attempts` the status goes to failed and nothing is reopened.
    pub fn reconnect(self: &Arc<Self>) -> ReconnectDecision {
        let mut decision = ReconnectDecision::AlreadyReconnecting;
        self.status.send_modify(|s| decision = s.begin_reconnect(&self.config));

        match decision {
            ReconnectDecision::AlreadyReconnecting => {
                crate::log_debug!("Reconnect already in progress for {}", self.params.session_id);
            }
            ReconnectDecision::Exhausted => {
                crate::log_error!(
                    "Giving up on session {} after {} reconnect attempts",
                    self.params.session_id,
                    self.config.max_attempts
                );
            }
            ReconnectDecision::Proceed { attempt } => {
                crate::log_info!(
                    "Reconnecting session {} in {}ms (attempt {}/{})",
                    self.params.session_id,
                    self.config.delay_ms,
                    attempt,
                    self.config.max_attempts
                );
                let this = self.clone();
                let task = tokio::spawn(async move {
                    this.channel.close().await;
                    tokio::time::sleep(this.config.delay()).await;
                    this.status.send_modify(|s| s.is_reconnecting = false);
                    this.open().await;
                });
                let previous = self
                    .reconnect_task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(task);
                if let Some(previous) = previous {
                    previous.abort();
                }
            }
        }
        decision
    }

    /// Cancel any pending reconnect, drop the channel, and mark the connection disconnected.
    pub async fn close(&self) {
        let pending = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = pending {
            task.abort();
        }
        self.channel.close().await;
        self.status.send_modify(ConnectionStatus::reset);
    }
}
