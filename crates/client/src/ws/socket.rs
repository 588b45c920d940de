//! Realtime provider over WebSocket (Phoenix v1 JSON frames) using tokio-tungstenite.
//!
//! Each joined channel owns its own socket: one task writes queued frames, one
//! reads and dispatches, one sends heartbeats, and one waits for the join reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codeclass_shared::{
    PresenceEventKind, PresenceState, RealtimeError, RealtimeMessage, SubscriptionStatus,
    TableChange, FRAME_BROADCAST, FRAME_POSTGRES_CHANGES, FRAME_PRESENCE, FRAME_PRESENCE_DIFF,
    FRAME_PRESENCE_STATE, PHX_CLOSE, PHX_ERROR, PHX_HEARTBEAT, PHX_JOIN, PHX_LEAVE, PHX_REPLY,
    PHX_TOPIC,
};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::backend::{ChannelFrame, ChannelHandle, JoinOptions, JoinedChannel, RealtimeBackend, TrackStatus};
use crate::config::SyncConfig;

/// Connects session channels to a realtime provider.
#[derive(Debug, Clone)]
pub struct RealtimeSocket {
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
    join_timeout: Duration,
    heartbeat_interval: Duration,
}

impl RealtimeSocket {
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = SyncConfig::default();
        Self {
            base_url: base_url.into(),
            api_key: None,
            access_token: None,
            join_timeout: defaults.join_timeout(),
            heartbeat_interval: defaults.heartbeat_interval(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_url: config.realtime_url.clone(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            join_timeout: config.join_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    /// Socket URL: `{base}/websocket?vsn=1.0.0[&apikey=...]`
    pub fn endpoint(&self) -> Result<String, RealtimeError> {
        let raw = format!("{}/websocket", self.base_url.trim_end_matches('/'));
        let mut url = url::Url::parse(&raw).map_err(|e| RealtimeError::Connect {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("vsn", "1.0.0");
            if let Some(key) = &self.api_key {
                query.append_pair("apikey", key);
            }
        }
        Ok(url.to_string())
    }

    fn join_payload(&self, options: &JoinOptions) -> Value {
        let table_changes: Vec<Value> = options
            .table_changes
            .iter()
            .map(|t| {
                let mut change = json!({ "event": "*", "schema": t.schema, "table": t.table });
                if let Some(filter) = &t.filter {
                    change["filter"] = Value::String(filter.clone());
                }
                change
            })
            .collect();

        let mut payload = json!({
            "config": {
                "broadcast": { "self": options.broadcast_self, "ack": false },
                "presence": { "key": options.presence_key.clone().unwrap_or_default() },
                "postgres_changes": table_changes,
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = Value::String(token.clone());
        }
        payload
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Reply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    response: Value,
}

/// State shared by the tasks of one joined channel.
struct Shared {
    topic: String,
    outbound: UnboundedSender<RealtimeMessage>,
    refs: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl Shared {
    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn push(&self, topic: &str, event: &str, payload: Value, msg_ref: Option<String>) -> Result<(), RealtimeError> {
        self.outbound
            .unbounded_send(RealtimeMessage {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
                msg_ref,
            })
            .map_err(|e| RealtimeError::Send(e.to_string()))
    }

    /// Send a frame on our topic and get a receiver for its reply.
    async fn request(&self, event: &str, payload: Value) -> Result<PendingReply, RealtimeError> {
        let msg_ref = self.next_ref();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg_ref.clone(), tx);
        if let Err(e) = self.push(&self.topic, event, payload, Some(msg_ref.clone())) {
            self.pending.lock().await.remove(&msg_ref);
            return Err(e);
        }
        Ok(PendingReply { msg_ref, rx })
    }

    /// Wait up to `timeout` for a reply. `None` on timeout, after which the
    /// ref no longer resolves anything.
    async fn await_reply(
        &self,
        reply: PendingReply,
        timeout: Duration,
    ) -> Option<Result<Reply, oneshot::error::RecvError>> {
        match tokio::time::timeout(timeout, reply.rx).await {
            Ok(result) => Some(result),
            Err(_) => {
                self.pending.lock().await.remove(&reply.msg_ref);
                None
            }
        }
    }
}

/// A request in flight, keyed by its ref in [`Shared::pending`].
struct PendingReply {
    msg_ref: String,
    rx: oneshot::Receiver<Reply>,
}

/// Folds `presence_state` / `presence_diff` frames into a full presence map.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    state: HashMap<String, Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPresence {
    #[serde(default)]
    metas: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDiff {
    #[serde(default)]
    joins: HashMap<String, RawPresence>,
    #[serde(default)]
    leaves: HashMap<String, RawPresence>,
}

fn phx_ref(meta: &Value) -> Option<&str> {
    meta.get("phx_ref").and_then(Value::as_str)
}

impl PresenceTracker {
    pub fn replace(&mut self, payload: Value) -> Result<(), serde_json::Error> {
        let raw: HashMap<String, RawPresence> = serde_json::from_value(payload)?;
        self.state = raw
            .into_iter()
            .filter(|(_, p)| !p.metas.is_empty())
            .map(|(key, p)| (key, p.metas))
            .collect();
        Ok(())
    }

    /// Apply a diff; returns (anyone joined, anyone left).
    pub fn apply_diff(&mut self, payload: Value) -> Result<(bool, bool), serde_json::Error> {
        let diff: RawDiff = serde_json::from_value(payload)?;
        let joined = !diff.joins.is_empty();
        let left = !diff.leaves.is_empty();

        for (key, presence) in diff.joins {
            let metas = self.state.entry(key).or_default();
            for meta in presence.metas {
                let duplicate = phx_ref(&meta).is_some_and(|r| metas.iter().any(|m| phx_ref(m) == Some(r)));
                if !duplicate {
                    metas.push(meta);
                }
            }
        }

        for (key, presence) in diff.leaves {
            let leaving: Vec<&str> = presence.metas.iter().filter_map(phx_ref).collect();
            if let Some(metas) = self.state.get_mut(&key) {
                if leaving.is_empty() {
                    metas.clear();
                } else {
                    metas.retain(|m| !phx_ref(m).is_some_and(|r| leaving.contains(&r)));
                }
                if metas.is_empty() {
                    self.state.remove(&key);
                }
            }
        }

        Ok((joined, left))
    }

    pub fn snapshot(&self) -> PresenceState {
        PresenceState(self.state.clone())
    }
}

/// Translate one inbound frame on our topic into channel frames.
fn dispatch(msg: RealtimeMessage, presence: &mut PresenceTracker) -> Vec<ChannelFrame> {
    match msg.event.as_str() {
        PHX_ERROR => vec![ChannelFrame::Status {
            status: SubscriptionStatus::ChannelError,
            reason: msg.payload.get("reason").and_then(Value::as_str).map(str::to_string),
        }],
        PHX_CLOSE => vec![ChannelFrame::status(SubscriptionStatus::Closed)],
        FRAME_BROADCAST => {
            let Some(event) = msg.payload.get("event").and_then(Value::as_str) else {
                crate::log_warn!("Broadcast without event name on {}", msg.topic);
                return Vec::new();
            };
            vec![ChannelFrame::Broadcast {
                event: event.to_string(),
                payload: msg.payload.get("payload").cloned().unwrap_or(Value::Null),
            }]
        }
        FRAME_POSTGRES_CHANGES => {
            let data = msg.payload.get("data").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<TableChange>(data) {
                Ok(change) => vec![ChannelFrame::TableChange(change)],
                Err(e) => {
                    crate::log_warn!("Ignoring malformed table change: {}", e);
                    Vec::new()
                }
            }
        }
        FRAME_PRESENCE_STATE => match presence.replace(msg.payload) {
            Ok(()) => vec![ChannelFrame::Presence {
                kind: PresenceEventKind::Sync,
                state: presence.snapshot(),
            }],
            Err(e) => {
                crate::log_warn!("Ignoring malformed presence state: {}", e);
                Vec::new()
            }
        },
        FRAME_PRESENCE_DIFF => match presence.apply_diff(msg.payload) {
            Ok((joined, left)) => {
                let state = presence.snapshot();
                let mut frames = Vec::with_capacity(3);
                if joined {
                    frames.push(ChannelFrame::Presence {
                        kind: PresenceEventKind::Join,
                        state: state.clone(),
                    });
                }
                if left {
                    frames.push(ChannelFrame::Presence {
                        kind: PresenceEventKind::Leave,
                        state: state.clone(),
                    });
                }
                frames.push(ChannelFrame::Presence {
                    kind: PresenceEventKind::Sync,
                    state,
                });
                frames
            }
            Err(e) => {
                crate::log_warn!("Ignoring malformed presence diff: {}", e);
                Vec::new()
            }
        },
        other => {
            crate::log_debug!("Ignoring {} frame on {}", other, msg.topic);
            Vec::new()
        }
    }
}

/// A channel joined over its own socket.
struct SocketChannel {
    shared: Arc<Shared>,
    reply_timeout: Duration,
    /// Reader, heartbeat and join watcher. The writer is left to finish on its own.
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    left: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ChannelHandle for SocketChannel {
    async fn track(&self, meta: Value) -> TrackStatus {
        let payload = json!({ "type": FRAME_PRESENCE, "event": "track", "payload": meta });
        let pending = match self.shared.request(FRAME_PRESENCE, payload).await {
            Ok(pending) => pending,
            Err(e) => return TrackStatus::Error(e.to_string()),
        };
        match self.shared.await_reply(pending, self.reply_timeout).await {
            Some(Ok(reply)) if reply.status == "ok" => TrackStatus::Ok,
            Some(Ok(reply)) => TrackStatus::Error(format!("{} {}", reply.status, reply.response)),
            Some(Err(_)) => TrackStatus::Error("channel closed before reply".to_string()),
            None => TrackStatus::TimedOut,
        }
    }

    async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg_ref = self.shared.next_ref();
        if let Err(e) = self.shared.push(&self.shared.topic, PHX_LEAVE, json!({}), Some(msg_ref)) {
            crate::log_debug!("phx_leave not sent: {}", e);
        }
        // Lets the writer drain the leave frame and close the socket.
        self.shared.outbound.close_channel();

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }
        crate::log_info!("Left realtime channel {}", self.shared.topic);
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.shared.outbound.close_channel();
        let tasks = match self.tasks.get_mut() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl RealtimeBackend for RealtimeSocket {
    async fn join(&self, topic: &str, options: JoinOptions) -> Result<JoinedChannel, RealtimeError> {
        let url = self.endpoint()?;
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        crate::log_info!("Realtime socket connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = unbounded::<RealtimeMessage>();
        let (frame_tx, frame_rx) = unbounded::<ChannelFrame>();

        let shared = Arc::new(Shared {
            topic: format!("realtime:{}", topic),
            outbound,
            refs: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        });

        // Writer: drains queued frames until the queue is closed by leave().
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.next().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        crate::log_debug!("Realtime send: {}", json);
                        if let Err(e) = write.send(Message::text(json)).await {
                            crate::log_error!("Realtime send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => crate::log_error!("Serialize failed: {}", e),
                }
            }
            let _ = write.close().await;
        });

        // Reader: replies resolve pending requests, everything else becomes frames.
        let reader = {
            let shared = shared.clone();
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                let mut presence = PresenceTracker::default();
                let mut clean_close = false;
                while let Some(msg_result) = read.next().await {
                    let text = match msg_result {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => {
                            clean_close = true;
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            crate::log_error!("Realtime read error: {}", e);
                            break;
                        }
                    };

                    let msg = match serde_json::from_str::<RealtimeMessage>(text.as_str()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            crate::log_warn!("Failed to parse realtime frame: {}", e);
                            continue;
                        }
                    };

                    if msg.event == PHX_REPLY {
                        if let Some(msg_ref) = &msg.msg_ref {
                            if let Some(waiter) = shared.pending.lock().await.remove(msg_ref) {
                                match serde_json::from_value::<Reply>(msg.payload.clone()) {
                                    Ok(reply) => {
                                        let _ = waiter.send(reply);
                                    }
                                    Err(e) => crate::log_warn!("Malformed reply {}: {}", msg_ref, e),
                                }
                            }
                        }
                        continue;
                    }

                    if msg.topic != shared.topic {
                        continue;
                    }

                    for frame in dispatch(msg, &mut presence) {
                        if frame_tx.unbounded_send(frame).is_err() {
                            return;
                        }
                    }
                }

                let status = if clean_close {
                    SubscriptionStatus::Closed
                } else {
                    SubscriptionStatus::ChannelError
                };
                let _ = frame_tx.unbounded_send(ChannelFrame::Status {
                    status,
                    reason: Some("socket closed".to_string()),
                });
            })
        };

        let heartbeat = {
            let shared = shared.clone();
            let period = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let msg_ref = shared.next_ref();
                    if shared.push(PHX_TOPIC, PHX_HEARTBEAT, json!({}), Some(msg_ref)).is_err() {
                        break;
                    }
                }
            })
        };

        let join_reply = shared.request(PHX_JOIN, self.join_payload(&options)).await?;
        let join_watch = {
            let frame_tx = frame_tx.clone();
            let timeout = self.join_timeout;
            let shared = shared.clone();
            tokio::spawn(async move {
                let frame = match shared.await_reply(join_reply, timeout).await {
                    Some(Ok(reply)) if reply.status == "ok" => ChannelFrame::status(SubscriptionStatus::Subscribed),
                    Some(Ok(reply)) => ChannelFrame::Status {
                        status: SubscriptionStatus::ChannelError,
                        reason: Some(reply.response.to_string()),
                    },
                    Some(Err(_)) => ChannelFrame::Status {
                        status: SubscriptionStatus::ChannelError,
                        reason: Some("socket closed before join reply".to_string()),
                    },
                    None => {
                        crate::log_warn!("Join of {} timed out", shared.topic);
                        ChannelFrame::status(SubscriptionStatus::TimedOut)
                    }
                };
                let _ = frame_tx.unbounded_send(frame);
            })
        };

        let channel = SocketChannel {
            shared,
            reply_timeout: self.join_timeout,
            tasks: std::sync::Mutex::new(vec![reader, heartbeat, join_watch]),
            left: std::sync::atomic::AtomicBool::new(false),
        };

        Ok(JoinedChannel {
            frames: frame_rx,
            handle: Arc::new(channel),
        })
    }
}
