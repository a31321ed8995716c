use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use parley_types::ports::{RateDecision, RateLimit};

#[derive(Debug, Clone, Copy)]
struct Window {
    /// Start of the window, in whole seconds since the epoch.
    started: i64,
    count: u32,
}

/// Per-user fixed-window counter. Windows are aligned to multiples of the
/// window length so every user sees the same reset boundaries.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    max: u32,
    window_secs: i64,
}

impl FixedWindowLimiter {
    pub fn new(max: u32, window_secs: u64) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max: max.max(1),
            window_secs: (window_secs as i64).max(1),
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.window_secs) * self.window_secs
    }

    /// Count one action at `now`.
    pub async fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> RateDecision {
        let started = self.window_start(now);
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(user_id.to_string())
            .or_insert(Window { started, count: 0 });

        if window.started != started {
            *window = Window { started, count: 0 };
        }

        if window.count >= self.max {
            let reset_secs = started + self.window_secs;
            let reset_at = Utc
                .timestamp_opt(reset_secs, 0)
                .single()
                .unwrap_or_else(|| now + chrono::Duration::seconds(self.window_secs));
            debug!("{} rate limited until {}", user_id, reset_at);
            return RateDecision::Limited { reset_at };
        }

        window.count += 1;
        RateDecision::Allowed {
            remaining: self.max - window.count,
        }
    }

    /// Drop counters for windows that have already closed.
    pub async fn purge_stale(&self) {
        let current = self.window_start(Utc::now());
        let mut windows = self.windows.lock().await;
        windows.retain(|_, window| window.started >= current);
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new(30, 60)
    }
}

#[async_trait]
impl RateLimit for FixedWindowLimiter {
    async fn check(&self, user_id: &str) -> RateDecision {
        self.check_at(user_id, Utc::now()).await
    }
}
