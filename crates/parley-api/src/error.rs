use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::error;

use parley_types::api::{ErrorBody, ErrorCode};
use parley_types::ports::BackendError;

use crate::orchestrator::SendError;

/// Errors returned by HTTP handlers. Collaborator failures are logged here
/// and reach the client only as a generic `unavailable`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid credentials")]
    Unauthorized,

    #[error("Not a participant of this chat")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error("Rate limit exceeded")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("Insufficient balance: {balance} available, {required} required")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound => Self::NotFound,
            BackendError::Unavailable(msg) => Self::Unavailable(msg),
        }
    }
}

impl From<SendError> for ApiError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Forbidden => Self::Forbidden,
            SendError::NotFound => Self::NotFound,
            SendError::Invalid(msg) => Self::Invalid(msg),
            SendError::RateLimited { reset_at } => Self::RateLimited { reset_at },
            SendError::InsufficientBalance { balance, required } => {
                Self::InsufficientBalance { balance, required }
            }
            SendError::Backend(msg) => Self::Unavailable(msg),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (code, message) = match self {
            Self::Unauthorized => (ErrorCode::Unauthorized, self.to_string()),
            Self::Forbidden => (ErrorCode::Forbidden, self.to_string()),
            Self::NotFound => (ErrorCode::NotFound, self.to_string()),
            Self::Invalid(_) => (ErrorCode::InvalidMessage, self.to_string()),
            Self::RateLimited { .. } => (ErrorCode::RateLimited, self.to_string()),
            Self::InsufficientBalance { .. } => (ErrorCode::InsufficientBalance, self.to_string()),
            Self::Unavailable(_) => (
                ErrorCode::Unavailable,
                "Service temporarily unavailable".to_string(),
            ),
        };

        let mut body = ErrorBody {
            code,
            message,
            reset_at: None,
            balance: None,
            required: None,
        };
        match self {
            Self::RateLimited { reset_at } => body.reset_at = Some(*reset_at),
            Self::InsufficientBalance { balance, required } => {
                body.balance = Some(*balance);
                body.required = Some(*required);
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Unavailable(detail) = &self {
            error!("Backend failure: {}", detail);
        }

        let status = self.status();
        let body = self.body();
        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimited { reset_at } = self {
            let secs = (reset_at - Utc::now()).num_seconds().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
