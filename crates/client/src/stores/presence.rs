//! Presence store for the users connected to a session channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use codeclass_shared::{PresenceEventKind, PresenceState};
use tokio::sync::watch;

/// Latest presence snapshot. Every sync/join/leave replaces it whole.
#[derive(Clone)]
pub struct PresenceStore {
    state: Arc<watch::Sender<PresenceState>>,
}

impl Default for PresenceStore {
    fn default() -> Self {
        let (state, _) = watch::channel(PresenceState::default());
        Self { state: Arc::new(state) }
    }
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, kind: PresenceEventKind, state: PresenceState) {
        crate::log_debug!("Presence {:?}: {} keys", kind, state.len());
        self.state.send_replace(state);
    }

    pub fn clear(&self) {
        self.state.send_replace(PresenceState::default());
    }

    pub fn snapshot(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.state.subscribe()
    }

    pub fn online_user_ids(&self) -> BTreeSet<String> {
        self.state.borrow().user_ids()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.state.borrow().is_online(user_id)
    }
}
