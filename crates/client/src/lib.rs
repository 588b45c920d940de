//! Codeclass client - realtime session sync
//!
//! Keeps one client's view of a live coding session consistent with the
//! server: a REST snapshot, realtime channel events while connected, and
//! snapshot polling while not. Outbound edits go through a debounced,
//! retried mutation pipeline.

pub mod api_client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod logging;
pub mod mutations;
pub mod polling;
pub mod retry;
pub mod session_sync;
pub mod stores;
pub mod ws;

pub use api_client::{ApiClient, SessionApi};
pub use config::SyncConfig;
pub use error::{MutationError, Operation};
pub use mutations::MutationPipeline;
pub use polling::PollingFallback;
pub use retry::{with_retry, RetryFailure, RetryPolicy};
pub use session_sync::{MountParams, SessionRole, SessionSync};
pub use stores::{PresenceStore, SessionState, SessionStore, Student};
pub use ws::{ConnectionState, ConnectionStatus, RealtimeConnection, RealtimeSocket, ReconnectConfig};
