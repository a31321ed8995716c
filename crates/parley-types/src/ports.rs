//! Contracts for the external collaborators the chat core consumes: the
//! authoritative message store, identity/access, the wallet and the rate
//! limiter. The server provides SQLite-backed implementations; tests provide
//! in-memory ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::api::MessageQuery;
use crate::models::{Message, NewMessage};

/// Failure reported by a collaborator. The text is for logs only.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("record not found")]
    NotFound,

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<anyhow::Error> for BackendError {
    fn from(e: anyhow::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages for a chat, ascending by `created_at`.
    async fn fetch(&self, chat_id: &str, query: &MessageQuery) -> BackendResult<Vec<Message>>;

    async fn get(&self, message_id: &str) -> BackendResult<Message>;

    /// Persist a message; returns the canonical row with server-assigned id and timestamp.
    async fn insert(&self, message: NewMessage) -> BackendResult<Message>;

    /// Stamp `read_at` on every unread message in the chat not sent by `reader_id`.
    async fn mark_read(&self, chat_id: &str, reader_id: &str) -> BackendResult<usize>;

    /// Append `user_id` to the message's unlock set. Appending is atomic, so
    /// of two racing calls for the same user exactly one reports `inserted`.
    async fn append_unlock(&self, message_id: &str, user_id: &str) -> BackendResult<Unlocked>;
}

/// The message after an unlock append.
#[derive(Debug, Clone)]
pub struct Unlocked {
    pub message: Message,
    /// False when the user was already in the unlock set.
    pub inserted: bool,
}

#[async_trait]
pub trait ChatAccess: Send + Sync {
    async fn is_participant(&self, chat_id: &str, user_id: &str) -> BackendResult<bool>;
}

/// Outcome of a wallet debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Debit {
    Applied { new_balance: i64 },
    Insufficient { balance: i64 },
}

#[async_trait]
pub trait Wallet: Send + Sync {
    async fn balance(&self, user_id: &str) -> BackendResult<i64>;

    /// Atomically subtract `amount`; refuses without side effects when the
    /// balance would go negative.
    async fn debit(&self, user_id: &str, amount: i64, description: &str) -> BackendResult<Debit>;

    /// Add `amount` (refunds and creator payouts). Returns the new balance.
    async fn credit(&self, user_id: &str, amount: i64, description: &str) -> BackendResult<i64>;
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { reset_at: DateTime<Utc> },
}

#[async_trait]
pub trait RateLimit: Send + Sync {
    /// Count one action for `user_id` in the current window.
    async fn check(&self, user_id: &str) -> RateDecision;
}
