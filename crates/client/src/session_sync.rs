//! One mounted session: store, presence, realtime connection, polling and
//! mutations wired together.
//!
//! Mounting opens the channel and fetches the first snapshot concurrently.
//! Channel events patch the store while connected; polling takes over
//! whenever they cannot. Unmounting drops queued code saves, stops polling,
//! cancels any reconnect and closes the channel.

use std::sync::Arc;
use std::time::Duration;

use codeclass_shared::{
    ExecutionResult, ExecutionSettings, JoinSessionResponse, PresenceEventKind, PresenceState, SessionEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::api_client::SessionApi;
use crate::config::SyncConfig;
use crate::error::MutationError;
use crate::mutations::MutationPipeline;
use crate::polling::PollingFallback;
use crate::stores::{PresenceStore, SessionState, SessionStore};
use crate::ws::{
    ConnectionStatus, EventHandler, OpenParams, PresenceHandler, RealtimeBackend, RealtimeConnection,
    ReconnectDecision,
};

/// Who is looking at the session. Sent along in presence metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Instructor,
    #[default]
    Student,
    /// Projector view, never tracked in presence
    Public,
}

#[derive(Debug, Clone, Default)]
pub struct MountParams {
    pub session_id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub role: SessionRole,
    /// Overrides the configured code-save debounce for this mount
    pub debounce: Option<Duration>,
}

impl MountParams {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, name: Option<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.name = name;
        self
    }

    pub fn with_role(mut self, role: SessionRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    fn open_params(&self) -> OpenParams {
        let params = OpenParams::new(self.session_id.clone());
        match (&self.user_id, self.role) {
            (Some(user_id), role) if role != SessionRole::Public => {
                let mut meta = json!({ "role": role });
                if let Some(name) = &self.name {
                    meta["name"] = Value::String(name.clone());
                }
                params.with_user(user_id.clone(), Some(meta))
            }
            _ => params,
        }
    }
}

pub struct SessionSync {
    role: SessionRole,
    user_id: Option<String>,
    store: SessionStore,
    presence: PresenceStore,
    connection: Arc<RealtimeConnection>,
    mutations: MutationPipeline,
    polling: PollingFallback,
}

impl SessionSync {
    pub async fn mount(
        config: &SyncConfig,
        api: Arc<dyn SessionApi>,
        backend: Arc<dyn RealtimeBackend>,
        params: MountParams,
    ) -> Self {
        let store = SessionStore::new(params.session_id.clone());
        let presence = PresenceStore::new();
        let open_params = params.open_params();

        let on_event: EventHandler = {
            let store = store.clone();
            Arc::new(move |event: SessionEvent| store.apply_event(event))
        };
        let on_presence: Option<PresenceHandler> = open_params.user_id.as_ref().map(|_| {
            let presence = presence.clone();
            Arc::new(move |kind: PresenceEventKind, state: PresenceState| presence.replace(kind, state))
                as PresenceHandler
        });

        let connection = RealtimeConnection::new(
            backend,
            open_params,
            config.reconnect.clone(),
            on_event,
            on_presence,
        );
        let mutations = MutationPipeline::new(
            api.clone(),
            store.clone(),
            config.retry.clone(),
            params.debounce.unwrap_or_else(|| config.debounce()),
        );
        let polling = PollingFallback::start(config.poll_interval(), connection.subscribe(), store.clone(), api.clone());

        crate::log_info!("Mounting session {} as {:?}", params.session_id, params.role);
        tokio::join!(connection.open(), store.ensure_loaded(api.as_ref(), &config.retry));

        Self {
            role: params.role,
            user_id: params.user_id,
            store,
            presence,
            connection,
            mutations,
            polling,
        }
    }

    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.store.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.polling.is_running()
    }

    pub fn reconnect(&self) -> ReconnectDecision {
        self.connection.reconnect()
    }

    /// Queue a debounced code save.
    pub fn update_code(&self, user_id: &str, code: impl Into<String>, execution_settings: Option<ExecutionSettings>) {
        self.mutations.update_code(user_id, code, execution_settings);
    }

    pub async fn update_code_now(
        &self,
        user_id: &str,
        code: impl Into<String>,
        execution_settings: Option<ExecutionSettings>,
    ) -> Result<(), MutationError> {
        self.mutations.update_code_now(user_id, code, execution_settings).await
    }

    pub async fn flush_pending_code(&self) -> usize {
        self.mutations.flush_pending_code().await
    }

    pub async fn execute_code(
        &self,
        user_id: &str,
        code: impl Into<String>,
        execution_settings: Option<ExecutionSettings>,
    ) -> Result<ExecutionResult, MutationError> {
        self.mutations.execute_code(user_id, code, execution_settings).await
    }

    pub async fn feature_student(&self, user_id: &str) -> Result<(), MutationError> {
        self.mutations.feature_student(user_id).await
    }

    pub async fn clear_featured(&self) -> Result<(), MutationError> {
        self.mutations.clear_featured().await
    }

    pub async fn join_session(&self, user_id: &str, name: &str) -> Result<JoinSessionResponse, MutationError> {
        self.mutations.join_session(user_id, name).await
    }

    /// Tear everything down. Queued code saves are dropped, not sent; call
    /// [`Self::flush_pending_code`] first to keep them.
    pub async fn unmount(&self) {
        crate::log_info!("Unmounting session {}", self.session_id());
        self.mutations.discard_pending_code();
        self.polling.stop();
        self.connection.close().await;
        self.presence.clear();
    }
}
