use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageDraft};

// -- JWT Claims --

/// JWT claims shared across parley-api (REST middleware) and the gateway
/// upgrade. Tokens are minted by the identity provider; we only verify them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: Option<String>,
    pub exp: usize,
}

// -- Messages --

pub const DEFAULT_FETCH_LIMIT: u32 = 50;
pub const MAX_FETCH_LIMIT: u32 = 200;

fn default_limit() -> u32 {
    DEFAULT_FETCH_LIMIT
}

/// Query parameters for fetching a chat's messages. Results are ascending by
/// `created_at`; `after` and `before` are both exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            limit: DEFAULT_FETCH_LIMIT,
        }
    }
}

impl MessageQuery {
    pub fn after(after: Option<DateTime<Utc>>, limit: u32) -> Self {
        Self { after, before: None, limit }
    }

    pub fn before(before: Option<DateTime<Utc>>, limit: u32) -> Self {
        Self { after: None, before, limit }
    }

    pub fn clamped_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_FETCH_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(flatten)]
    pub draft: MessageDraft,
    /// Provisional id the client rendered optimistically; echoed back.
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: Message,
    pub balance: i64,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockResponse {
    pub message: Message,
    pub balance: i64,
}

// -- Wallet --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: i64,
}

// -- Errors --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidMessage,
    RateLimited,
    InsufficientBalance,
    Unavailable,
}

/// JSON body of every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<i64>,
}
