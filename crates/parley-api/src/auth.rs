use std::sync::Arc;

use jsonwebtoken::{EncodingKey, Header, encode};

use parley_gateway::dispatcher::Dispatcher;
use parley_types::api::Claims;
use parley_types::ports::{ChatAccess, MessageStore, Wallet};

use crate::orchestrator::SendOrchestrator;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Arc<dyn MessageStore>,
    pub access: Arc<dyn ChatAccess>,
    pub wallet: Arc<dyn Wallet>,
    pub orchestrator: SendOrchestrator,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

/// Mint a token the middleware accepts. Production tokens come from the
/// identity provider; this exists for local development and tests.
pub fn create_token(
    secret: &str,
    user_id: &str,
    name: Option<&str>,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        name: name.map(str::to_string),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
