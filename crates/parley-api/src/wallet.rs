use axum::{Extension, Json, extract::State, response::IntoResponse};

use parley_types::api::{BalanceResponse, Claims};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let balance = state.wallet.balance(&claims.sub).await?;
    Ok(Json(BalanceResponse { balance }))
}
