//! Snapshot polling while the realtime channel is down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api_client::SessionApi;
use crate::stores::SessionStore;
use crate::ws::ConnectionStatus;

/// Re-fetches the session snapshot every `interval` whenever the connection
/// is not connected and the first load has finished.
///
/// One task per instance, so there is never more than one poll timer for a
/// session. Dropping the value stops it.
pub struct PollingFallback {
    task: JoinHandle<()>,
}

impl PollingFallback {
    pub fn start(
        interval: Duration,
        status: watch::Receiver<ConnectionStatus>,
        store: SessionStore,
        api: Arc<dyn SessionApi>,
    ) -> Self {
        let task = tokio::spawn(run(interval, status, store, api));
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    interval: Duration,
    mut status: watch::Receiver<ConnectionStatus>,
    store: SessionStore,
    api: Arc<dyn SessionApi>,
) {
    let mut state = store.subscribe();
    if state.wait_for(|s| s.initial_load_done).await.is_err() {
        return;
    }

    loop {
        if status.wait_for(|s| !s.is_connected()).await.is_err() {
            return;
        }
        crate::log_info!(
            "Realtime unavailable for session {}, polling every {:?}",
            store.session_id(),
            interval
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // A snapshot still in flight when the channel comes back
                    // is dropped so it cannot overwrite live patches.
                    tokio::select! {
                        biased;
                        open = async { status.wait_for(|s| s.is_connected()).await.is_ok() } => {
                            if !open {
                                return;
                            }
                            break;
                        }
                        fetched = api.fetch_state(store.session_id()) => match fetched {
                            Ok(snapshot) => store.apply_snapshot(snapshot),
                            Err(e) => crate::log_warn!("Poll for session {} failed: {}", store.session_id(), e),
                        },
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if status.borrow_and_update().is_connected() {
                        break;
                    }
                }
            }
        }
        crate::log_info!("Realtime back for session {}, polling stopped", store.session_id());
    }
}
