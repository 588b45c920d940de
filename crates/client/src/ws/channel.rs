//! One logical realtime channel per session.
//!
//! The transport never touches the store: it decodes frames and calls the
//! handlers it was built with.

use std::sync::Arc;

use chrono::Utc;
use codeclass_shared::{
    presence_record, session_topic, PresenceEventKind, PresenceState, SessionEvent, SubscriptionStatus,
    STUDENTS_TABLE,
};
use futures_channel::mpsc::UnboundedReceiver;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::backend::{ChannelFrame, ChannelHandle, JoinOptions, RealtimeBackend, TableFilter, TrackStatus};

pub type EventHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;
pub type PresenceHandler = Arc<dyn Fn(PresenceEventKind, PresenceState) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(SubscriptionStatus, Option<String>) + Send + Sync>;

/// Callbacks a channel reports to.
#[derive(Clone)]
pub struct ChannelHandlers {
    pub on_event: EventHandler,
    /// Only called when the channel was opened with a user id
    pub on_presence: Option<PresenceHandler>,
    pub on_status: StatusHandler,
}

/// What to open a channel for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenParams {
    pub session_id: String,
    /// Tracked in presence when set
    pub user_id: Option<String>,
    /// Extra presence metadata (e.g. name, role)
    pub presence_data: Option<Value>,
}

impl OpenParams {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, presence_data: Option<Value>) -> Self {
        self.user_id = Some(user_id.into());
        self.presence_data = presence_data;
        self
    }
}

struct ActiveChannel {
    topic: String,
    handle: Arc<dyn ChannelHandle>,
    pump: JoinHandle<()>,
}

/// Channel transport for a single session.
pub struct SessionChannel {
    backend: Arc<dyn RealtimeBackend>,
    handlers: ChannelHandlers,
    active: Mutex<Option<ActiveChannel>>,
}

impl SessionChannel {
    pub fn new(backend: Arc<dyn RealtimeBackend>, handlers: ChannelHandlers) -> Self {
        Self {
            backend,
            handlers,
            active: Mutex::new(None),
        }
    }

    /// Open the channel for `params.session_id`, replacing any open one.
    /// Returns false (and does nothing) when the session id is empty.
    pub async fn open(&self, params: &OpenParams) -> bool {
        if params.session_id.is_empty() {
            crate::log_debug!("No session id, not opening a channel");
            return false;
        }

        self.close().await;

        let topic = session_topic(&params.session_id);
        let options = JoinOptions {
            presence_key: params.user_id.clone(),
            broadcast_self: false,
            table_changes: vec![TableFilter::students(&params.session_id)],
        };

        crate::log_info!("Opening channel {}", topic);
        match self.backend.join(&topic, options).await {
            Ok(joined) => {
                let pump = tokio::spawn(pump_frames(
                    joined.frames,
                    joined.handle.clone(),
                    self.handlers.clone(),
                    params.clone(),
                ));
                *self.active.lock().await = Some(ActiveChannel {
                    topic,
                    handle: joined.handle,
                    pump,
                });
            }
            Err(e) => {
                crate::log_error!("Failed to open channel {}: {}", topic, e);
                (self.handlers.on_status)(SubscriptionStatus::ChannelError, Some(e.to_string()));
            }
        }
        true
    }

    /// Unsubscribe and drop the channel. Safe to call when nothing is open.
    pub async fn close(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            active.pump.abort();
            active.handle.leave().await;
            crate::log_info!("Closed channel {}", active.topic);
        }
    }

    pub async fn is_open(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

async fn pump_frames(
    mut frames: UnboundedReceiver<ChannelFrame>,
    handle: Arc<dyn ChannelHandle>,
    handlers: ChannelHandlers,
    params: OpenParams,
) {
    while let Some(frame) = frames.next().await {
        match frame {
            ChannelFrame::Status { status, reason } => {
                crate::log_info!("Channel for session {} status: {:?}", params.session_id, status);
                (handlers.on_status)(status, reason);
                if status == SubscriptionStatus::Subscribed {
                    if let Some(user_id) = &params.user_id {
                        track_presence(handle.clone(), user_id.clone(), params.presence_data.clone());
                    }
                }
            }
            ChannelFrame::Broadcast { event, payload } => match SessionEvent::from_broadcast(&event, payload) {
                Ok(event) => (handlers.on_event)(event),
                Err(e) => crate::log_warn!("Dropping broadcast '{}': {}", event, e),
            },
            ChannelFrame::TableChange(change) => {
                if !change.table.is_empty() && change.table != STUDENTS_TABLE {
                    continue;
                }
                match SessionEvent::from_table_change(&change) {
                    Ok(event) => (handlers.on_event)(event),
                    Err(e) => crate::log_warn!("Dropping {:?} change: {}", change.kind, e),
                }
            }
            ChannelFrame::Presence { kind, state } => {
                if params.user_id.is_none() {
                    continue;
                }
                if let Some(on_presence) = &handlers.on_presence {
                    on_presence(kind, state);
                }
            }
        }
    }
    crate::log_debug!("Frame stream for session {} ended", params.session_id);
}

/// Presence is best effort: failures are logged and never affect the connection.
fn track_presence(handle: Arc<dyn ChannelHandle>, user_id: String, extra: Option<Value>) {
    tokio::spawn(async move {
        let record = presence_record(&user_id, Utc::now(), extra.as_ref());
        match handle.track(record).await {
            TrackStatus::Ok => crate::log_debug!("Tracking presence for {}", user_id),
            TrackStatus::Error(reason) => crate::log_warn!("Presence tracking failed for {}: {}", user_id, reason),
            TrackStatus::TimedOut => crate::log_warn!("Presence tracking timed out for {}", user_id),
        }
    });
}
