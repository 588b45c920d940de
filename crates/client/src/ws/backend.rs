//! The seam between the session transport and a managed realtime provider.
//!
//! A provider joins a topic and hands back a stream of [`ChannelFrame`]s plus a
//! [`ChannelHandle`] for presence tracking and teardown. Frames are still
//! untyped here; [`super::SessionChannel`] narrows them.

use std::sync::Arc;

use async_trait::async_trait;
use codeclass_shared::{
    PresenceEventKind, PresenceState, RealtimeError, SubscriptionStatus, TableChange, STUDENTS_TABLE,
};
use futures_channel::mpsc::UnboundedReceiver;
use serde_json::Value;

/// One thing a joined channel can report.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Status {
        status: SubscriptionStatus,
        reason: Option<String>,
    },
    Broadcast {
        event: String,
        payload: Value,
    },
    TableChange(TableChange),
    /// Always the full presence state after the change, never a diff.
    Presence {
        kind: PresenceEventKind,
        state: PresenceState,
    },
}

impl ChannelFrame {
    pub fn status(status: SubscriptionStatus) -> Self {
        ChannelFrame::Status { status, reason: None }
    }
}

/// Row-change subscription for one table, narrowed by a filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFilter {
    pub schema: String,
    pub table: String,
    pub filter: Option<String>,
}

impl TableFilter {
    /// Row changes of one session's students.
    pub fn students(session_id: &str) -> Self {
        Self {
            schema: "public".to_string(),
            table: STUDENTS_TABLE.to_string(),
            filter: Some(format!("session_id=eq.{}", session_id)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOptions {
    /// Key under which this client's presence is tracked
    pub presence_key: Option<String>,
    /// Whether our own broadcasts are echoed back to us
    pub broadcast_self: bool,
    pub table_changes: Vec<TableFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackStatus {
    Ok,
    Error(String),
    TimedOut,
}

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Publish presence metadata for this connection.
    async fn track(&self, meta: Value) -> TrackStatus;

    /// Unsubscribe and release the underlying connection. Idempotent.
    async fn leave(&self);
}

pub struct JoinedChannel {
    pub frames: UnboundedReceiver<ChannelFrame>,
    pub handle: Arc<dyn ChannelHandle>,
}

#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Start joining `topic`. The outcome arrives as a status frame; an `Err`
    /// here means the provider could not even be reached.
    async fn join(&self, topic: &str, options: JoinOptions) -> Result<JoinedChannel, RealtimeError>;
}
