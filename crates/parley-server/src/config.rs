//! Server configuration loaded from environment variables.
//!
//! Every setting has a development default so the server starts with zero
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `PARLEY_JWT_SECRET`
    pub jwt_secret: String,

    /// Env: `PARLEY_DB_PATH`
    /// Default: `parley.db`
    pub db_path: PathBuf,

    /// Env: `PARLEY_HOST`
    pub host: String,

    /// Env: `PARLEY_PORT`
    pub port: u16,

    /// Sends allowed per user per window.
    /// Env: `PARLEY_RATE_LIMIT_MAX`
    pub rate_limit_max: u32,

    /// Env: `PARLEY_RATE_LIMIT_WINDOW_SECS`
    pub rate_limit_window: Duration,

    /// Presence entries without a heartbeat for this long are dropped.
    /// Clients heartbeat every 30s, so the default allows one missed beat.
    /// Env: `PARLEY_PRESENCE_TIMEOUT_SECS`
    pub presence_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".to_string(),
            db_path: PathBuf::from("parley.db"),
            host: "0.0.0.0".to_string(),
            port: 3000,
            rate_limit_max: 30,
            rate_limit_window: Duration::from_secs(60),
            presence_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(secret) = std::env::var("PARLEY_JWT_SECRET") {
            config.jwt_secret = secret;
        }
        if let Ok(path) = std::env::var("PARLEY_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(host) = std::env::var("PARLEY_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var("PARLEY_PORT") {
            config.port = port;
        }
        if let Some(max) = parse_var("PARLEY_RATE_LIMIT_MAX") {
            config.rate_limit_max = max;
        }
        if let Some(secs) = parse_var("PARLEY_RATE_LIMIT_WINDOW_SECS") {
            config.rate_limit_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("PARLEY_PRESENCE_TIMEOUT_SECS") {
            config.presence_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
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
