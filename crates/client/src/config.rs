//! Sync configuration, with defaults and environment overrides.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::ws::ReconnectConfig;

const DEFAULT_API_URL: &str = "http://localhost:3000/api";
const DEFAULT_REALTIME_URL: &str = "ws://localhost:4000/realtime/v1";

/// Everything the sync core needs to know about its environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the session REST API (e.g. "https://host/api")
    pub api_url: String,
    /// Base URL of the realtime provider; `/websocket` is appended
    pub realtime_url: String,
    /// Public key sent to the realtime provider and as `apikey` header
    pub api_key: Option<String>,
    /// Bearer token for REST calls
    pub access_token: Option<String>,
    /// Quiet period before a burst of code edits is written
    pub debounce_ms: u64,
    /// Snapshot re-fetch period while the channel is down
    pub poll_interval_ms: u64,
    /// How long the provider gets to acknowledge a join before it counts as timed out
    pub join_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect: ReconnectConfig,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            api_key: None,
            access_token: None,
            debounce_ms: 300,
            poll_interval_ms: 2000,
            join_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            reconnect: ReconnectConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Build a config from environment variables.
    ///
    /// Environment variables:
    /// - `CODECLASS_API_URL`: session REST API base (default: "http://localhost:3000/api")
    /// - `CODECLASS_REALTIME_URL`: realtime provider base (default: "ws://localhost:4000/realtime/v1")
    /// - `CODECLASS_API_KEY`, `CODECLASS_ACCESS_TOKEN`: credentials (default: none)
    /// - `CODECLASS_DEBOUNCE_MS`, `CODECLASS_POLL_INTERVAL_MS`,
    ///   `CODECLASS_MAX_RECONNECT_ATTEMPTS`: tuning (defaults: 300, 2000, 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut reconnect = defaults.reconnect.clone();
        reconnect.max_attempts = env_number("CODECLASS_MAX_RECONNECT_ATTEMPTS", reconnect.max_attempts);

        Self {
            api_url: std::env::var("CODECLASS_API_URL").unwrap_or(defaults.api_url),
            realtime_url: std::env::var("CODECLASS_REALTIME_URL").unwrap_or(defaults.realtime_url),
            api_key: std::env::var("CODECLASS_API_KEY").ok().filter(|v| !v.is_empty()),
            access_token: std::env::var("CODECLASS_ACCESS_TOKEN").ok().filter(|v| !v.is_empty()),
            debounce_ms: env_number("CODECLASS_DEBOUNCE_MS", defaults.debounce_ms),
            poll_interval_ms: env_number("CODECLASS_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            reconnect,
            ..defaults
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_realtime_url(mut self, realtime_url: impl Into<String>) -> Self {
        self.realtime_url = realtime_url.into();
        self
    }

    pub fn with_credentials(mut self, api_key: Option<String>, access_token: Option<String>) -> Self {
        self.api_key = api_key;
        self.access_token = access_token;
        self
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                crate::log_warn!("Ignoring {}={:?}: not a number", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
