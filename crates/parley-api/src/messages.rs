use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, warn};

use parley_types::api::{Claims, MessageQuery, SendMessageRequest, SendMessageResponse, UnlockResponse};

use crate::auth::AppState;
use crate::error::ApiError;

/// Messages of a chat in ascending order, windowed by `after`/`before`.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.access.is_participant(&chat_id, &claims.sub).await? {
        return Err(ApiError::Forbidden);
    }

    let messages = state.store.fetch(&chat_id, &query).await?;
    debug!("{} fetched {} messages from {}", claims.sub, messages.len(), chat_id);
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.orchestrator.send(&chat_id, &claims.sub, req.draft).await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message: receipt.message,
            balance: receipt.balance,
            client_id: req.client_id,
        }),
    ))
}

/// Mark the chat read for the caller. Receipts are best-effort: the request
/// is accepted immediately and failures are only logged.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> StatusCode {
    tokio::spawn(async move {
        match state.access.is_participant(&chat_id, &claims.sub).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Read receipt access check for {} failed: {}", chat_id, e);
                return;
            }
        }
        match state.store.mark_read(&chat_id, &claims.sub).await {
            Ok(n) => debug!("{} read {} messages in {}", claims.sub, n, chat_id),
            Err(e) => warn!("Failed to mark {} read for {}: {}", chat_id, claims.sub, e),
        }
    });

    StatusCode::ACCEPTED
}

pub async fn unlock_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .orchestrator
        .unlock(&chat_id, &message_id, &claims.sub)
        .await?;

    Ok(Json(UnlockResponse {
        message: receipt.message,
        balance: receipt.balance,
    }))
}
