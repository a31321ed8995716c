//! Client configuration. Every cadence has a default; `from_env` overrides
//! the ones worth tuning per deployment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the Parley server.
    /// Env: `PARLEY_SERVER_URL`
    pub server_url: String,

    /// Local cache file.
    /// Env: `PARLEY_CACHE_PATH`
    pub cache_path: PathBuf,

    /// Incremental sync cadence while in the foreground.
    /// Env: `PARLEY_SYNC_INTERVAL_SECS`
    pub sync_interval: Duration,

    /// Minimum time between maintenance passes.
    pub maintenance_interval: Duration,

    /// Cached messages older than this (by cache time) are evicted.
    /// Env: `PARLEY_CACHE_RETENTION_DAYS`
    pub retention: Duration,

    /// Eviction never removes the newest `keep_recent` messages of a chat.
    pub keep_recent: u32,

    /// Hard cap of cached messages per chat.
    /// Env: `PARLEY_CACHE_MAX_PER_CHAT`
    pub max_per_chat: u32,

    /// Page size for sync fetches.
    pub page_size: u32,

    /// Attempts per read-path fetch before the chat is skipped for this pass.
    pub read_retries: u32,

    /// Time allowed for a subscription to be acknowledged.
    /// Env: `PARLEY_SUBSCRIBE_TIMEOUT_SECS`
    pub subscribe_timeout: Duration,

    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,

    pub heartbeat_interval: Duration,

    /// A user is online while their last heartbeat is younger than
    /// `heartbeat_interval * presence_timeout_multiplier`.
    pub presence_timeout_multiplier: u32,

    /// Liveness window of typing signals and the send debounce window.
    pub typing_window: Duration,

    pub typing_prune_tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            cache_path: PathBuf::from("parley-cache.db"),
            sync_interval: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(7 * 24 * 60 * 60),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            keep_recent: 50,
            max_per_chat: 1000,
            page_size: parley_types::api::DEFAULT_FETCH_LIMIT,
            read_retries: 3,
            subscribe_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            presence_timeout_multiplier: 2,
            typing_window: Duration::from_secs(3),
            typing_prune_tick: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Load overrides from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PARLEY_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(path) = std::env::var("PARLEY_CACHE_PATH") {
            config.cache_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>("PARLEY_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(days) = parse_var::<u64>("PARLEY_CACHE_RETENTION_DAYS") {
            config.retention = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(max) = parse_var("PARLEY_CACHE_MAX_PER_CHAT") {
            config.max_per_chat = max;
        }
        if let Some(secs) = parse_var::<u64>("PARLEY_SUBSCRIBE_TIMEOUT_SECS") {
            config.subscribe_timeout = Duration::from_secs(secs.max(1));
        }

        config
    }

    pub fn presence_timeout(&self) -> Duration {
        self.heartbeat_interval * self.presence_timeout_multiplier
    }

    /// WebSocket gateway URL derived from the HTTP base URL.
    pub fn gateway_url(&self, token: &str) -> String {
        format!(
            "{}/gateway?token={}",
            self.server_url
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
            token
        )
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(value = %value, "Invalid {}, using default", name);
            None
        }
    }
}
