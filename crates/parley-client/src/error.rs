use chrono::{DateTime, Utc};
use thiserror::Error;

use parley_types::api::{ErrorBody, ErrorCode};

#[derive(Debug, Error)]
pub enum CacheError {
    /// The store failed to open once; the cache stays off for this process.
    #[error("local cache disabled")]
    Disabled,

    #[error("cache storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt cache row: {0}")]
    Corrupt(String),

    #[error("cache worker failed: {0}")]
    Worker(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Failures surfaced to the UI layer. Each variant maps to a distinct user
/// message; raw backend text only travels in `Transient` for logging.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not signed in")]
    Unauthorized,

    #[error("no access to this chat")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ClientError {
    /// Whether a read path may retry this automatically. Sends never retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Transport(_))
    }

    /// "retry in N seconds/minutes" for rate-limit errors.
    pub fn retry_hint(&self, now: DateTime<Utc>) -> Option<String> {
        let Self::RateLimited { reset_at } = self else {
            return None;
        };

        let secs = (*reset_at - now).num_seconds().max(1);
        Some(if secs < 60 {
            format!("retry in {} {}", secs, plural(secs, "second"))
        } else {
            let mins = (secs + 59) / 60;
            format!("retry in {} {}", mins, plural(mins, "minute"))
        })
    }

    /// Map a typed API error body.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::Unauthorized => Self::Unauthorized,
            ErrorCode::Forbidden => Self::Forbidden,
            ErrorCode::NotFound => Self::NotFound,
            ErrorCode::InvalidMessage => Self::Invalid(body.message),
            ErrorCode::RateLimited => match body.reset_at {
                Some(reset_at) => Self::RateLimited { reset_at },
                None => Self::Transient(body.message),
            },
            ErrorCode::InsufficientBalance => Self::InsufficientBalance {
                balance: body.balance.unwrap_or(0),
                required: body.required.unwrap_or(0),
            },
            ErrorCode::Unavailable => Self::Transient(body.message),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        unit.to_string()
    } else {
        format!("{unit}s")
    }
}
