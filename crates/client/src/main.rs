//! codeclass-watch - follow a live session from the terminal
//!
//! Usage: `codeclass-watch <session-id> [user-id]`
//!
//! Endpoints and credentials come from the `CODECLASS_*` environment
//! variables (see [`SyncConfig::from_env`]). Ctrl-C unmounts cleanly.

use std::sync::Arc;

use anyhow::{bail, Context};
use codeclass_client::{ApiClient, MountParams, RealtimeSocket, SessionRole, SessionState, SessionSync, SyncConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codeclass_client=debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(session_id) = args.next().filter(|id| !id.is_empty()) else {
        bail!("usage: codeclass-watch <session-id> [user-id]");
    };
    let user_id = args.next();

    let config = SyncConfig::from_env();
    let api = ApiClient::new()
        .with_base_url(config.api_url.clone())
        .with_credentials(config.api_key.clone(), config.access_token.clone());
    let socket = RealtimeSocket::from_config(&config);
    socket.endpoint().context("invalid realtime url")?;

    let mut params = MountParams::new(session_id).with_role(SessionRole::Instructor);
    if let Some(user_id) = user_id {
        params = params.with_user(user_id, Some("codeclass-watch".to_string()));
    }

    let sync = SessionSync::mount(&config, Arc::new(api), Arc::new(socket), params).await;
    if let Some(error) = sync.state().error {
        tracing::warn!("Initial load failed: {}", error);
    }

    let mut state = sync.subscribe_state();
    let mut status = sync.subscribe_status();
    let mut presence = sync.presence().subscribe();
    print_state(&state.borrow_and_update());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                print_state(&state.borrow_and_update());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status.borrow_and_update().clone();
                match status.error {
                    Some(error) => tracing::info!("Connection {:?}: {}", status.state, error),
                    None => tracing::info!("Connection {:?}", status.state),
                }
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = presence.borrow_and_update().user_ids();
                tracing::info!("Online: {}", online.into_iter().collect::<Vec<_>>().join(", "));
            }
        }
    }

    sync.unmount().await;
    Ok(())
}

fn print_state(state: &SessionState) {
    let Some(session) = &state.session else {
        return;
    };
    tracing::info!(
        "Session {} [{:?}] {} students, featured: {}",
        session.id,
        session.status,
        state.students.len(),
        state.featured.student_id.as_deref().unwrap_or("-")
    );
    for student in state.roster() {
        tracing::debug!("  {} ({}): {} bytes", student.name, student.user_id, student.code.len());
    }
}
