//! Realtime channel protocol: frame envelope, typed session events, presence.
//!
//! Broadcast and database-change payloads arrive as loose JSON. They are
//! narrowed into [`SessionEvent`] here, at the edge, so everything behind the
//! transport matches on a closed set of variants.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ExecutionSettings, Problem};

/// Broadcast event names carried on a session channel.
pub const EVENT_STUDENT_JOINED: &str = "student_joined";
pub const EVENT_STUDENT_CODE_UPDATED: &str = "student_code_updated";
pub const EVENT_STUDENT_REMOVED: &str = "student_removed";
pub const EVENT_SESSION_ENDED: &str = "session_ended";
pub const EVENT_FEATURED_STUDENT_CHANGED: &str = "featured_student_changed";
pub const EVENT_PROBLEM_UPDATED: &str = "problem_updated";

/// Table whose row changes are forwarded as student events.
pub const STUDENTS_TABLE: &str = "session_students";

/// Phoenix frame events used by the realtime provider.
pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_HEARTBEAT: &str = "heartbeat";
pub const PHX_TOPIC: &str = "phoenix";
pub const FRAME_BROADCAST: &str = "broadcast";
pub const FRAME_PRESENCE: &str = "presence";
pub const FRAME_PRESENCE_STATE: &str = "presence_state";
pub const FRAME_PRESENCE_DIFF: &str = "presence_diff";
pub const FRAME_POSTGRES_CHANGES: &str = "postgres_changes";

/// Logical channel name for a session.
pub fn session_topic(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// One frame on the realtime socket (Phoenix v1 JSON serializer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

/// Status of a channel subscription as reported by the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

// --- Session events ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentPayload {
    #[serde(alias = "studentId")]
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "lastUpdated", alias = "updatedAt")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_settings: Option<ExecutionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StudentRemovedPayload {
    #[serde(alias = "studentId")]
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedPayload {
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeaturedChangedPayload {
    #[serde(default, alias = "studentId")]
    pub featured_student_id: Option<String>,
    #[serde(default, alias = "code")]
    pub featured_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProblemUpdatedPayload {
    pub problem: Problem,
}

/// Everything a session channel can tell the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    StudentJoined(StudentPayload),
    StudentCodeUpdated(StudentPayload),
    StudentRemoved(StudentRemovedPayload),
    SessionEnded(SessionEndedPayload),
    FeaturedStudentChanged(FeaturedChangedPayload),
    ProblemUpdated(ProblemUpdatedPayload),
}

impl SessionEvent {
    /// Narrow a named broadcast with a JSON payload.
    pub fn from_broadcast(event: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let payload = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload
        };
        serde_json::from_value(serde_json::json!({ "event": event, "payload": payload }))
    }

    /// Narrow a database change on the students table.
    pub fn from_table_change(change: &TableChange) -> Result<Self, serde_json::Error> {
        match change.kind {
            TableChangeKind::Insert => {
                let row: StudentRow = serde_json::from_value(change.record.clone())?;
                Ok(SessionEvent::StudentJoined(row.into()))
            }
            TableChangeKind::Update => {
                let row: StudentRow = serde_json::from_value(change.record.clone())?;
                Ok(SessionEvent::StudentCodeUpdated(row.into()))
            }
            TableChangeKind::Delete => {
                let key: StudentKey = serde_json::from_value(change.old_record.clone())?;
                Ok(SessionEvent::StudentRemoved(StudentRemovedPayload {
                    user_id: key.user_id,
                }))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StudentJoined(_) => EVENT_STUDENT_JOINED,
            SessionEvent::StudentCodeUpdated(_) => EVENT_STUDENT_CODE_UPDATED,
            SessionEvent::StudentRemoved(_) => EVENT_STUDENT_REMOVED,
            SessionEvent::SessionEnded(_) => EVENT_SESSION_ENDED,
            SessionEvent::FeaturedStudentChanged(_) => EVENT_FEATURED_STUDENT_CHANGED,
            SessionEvent::ProblemUpdated(_) => EVENT_PROBLEM_UPDATED,
        }
    }
}

// --- Database changes ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableChangeKind {
    Insert,
    Update,
    Delete,
}

/// The `data` object of a `postgres_changes` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableChange {
    #[serde(rename = "type", alias = "eventType")]
    pub kind: TableChangeKind,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
}

/// A row of the students table (snake_case columns).
#[derive(Debug, Clone, Deserialize)]
struct StudentRow {
    #[serde(alias = "student_id")]
    user_id: String,
    #[serde(default, alias = "student_name")]
    name: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "last_update")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    execution_settings: Option<ExecutionSettings>,
}

#[derive(Debug, Clone, Deserialize)]
struct StudentKey {
    #[serde(alias = "student_id")]
    user_id: String,
}

impl From<StudentRow> for StudentPayload {
    fn from(row: StudentRow) -> Self {
        Self {
            user_id: row.user_id,
            name: row.name,
            code: row.code,
            last_update: row.updated_at,
            execution_settings: row.execution_settings,
        }
    }
}

// --- Presence ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEventKind {
    Sync,
    Join,
    Leave,
}

/// Presence key to the metadata records tracked under it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct PresenceState(pub HashMap<String, Vec<Value>>);

impl PresenceState {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Distinct tracked user ids across all keys.
    pub fn user_ids(&self) -> BTreeSet<String> {
        self.0
            .values()
            .flatten()
            .filter_map(|meta| {
                meta.get("userId")
                    .or_else(|| meta.get("user_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.user_ids().contains(user_id)
    }
}

/// Build the record published when a client tracks itself on a channel.
/// Caller metadata is merged in but cannot override the id or timestamp.
pub fn presence_record(user_id: &str, joined_at: DateTime<Utc>, extra: Option<&Value>) -> Value {
    let mut record = serde_json::Map::new();
    if let Some(Value::Object(extra)) = extra {
        for (k, v) in extra {
            record.insert(k.clone(), v.clone());
        }
    }
    record.insert("userId".to_string(), Value::String(user_id.to_string()));
    record.insert("onlineAt".to_string(), Value::String(joined_at.to_rfc3339()));
    Value::Object(record)
}
