mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::backend::SqliteBackend;
use parley_api::error::ApiError;
use parley_api::middleware::{decode_token, require_auth};
use parley_api::orchestrator::SendOrchestrator;
use parley_api::rate_limit::FixedWindowLimiter;
use parley_api::{messages, wallet};
use parley_db::Database;
use parley_gateway::connection;
use parley_gateway::dispatcher::{self, Dispatcher};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env();
    let db = Arc::new(Database::open(&config.db_path)?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return run_admin(&config, &db, &args);
    }

    serve(config, db).await
}

/// Development helpers: the identity provider and chat membership live
/// outside this server, so local setups mint tokens and seed rows here.
fn run_admin(config: &ServerConfig, db: &Database, args: &[String]) -> anyhow::Result<()> {
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["token", user_id] => {
            let token = auth::create_token(&config.jwt_secret, user_id, None, chrono::Duration::days(30))?;
            println!("{token}");
        }
        ["token", user_id, name] => {
            let token =
                auth::create_token(&config.jwt_secret, user_id, Some(*name), chrono::Duration::days(30))?;
            println!("{token}");
        }
        ["add-member", chat_id, user_id] => {
            db.create_chat(chat_id)?;
            db.add_participant(chat_id, user_id)?;
            info!("Added {} to {}", user_id, chat_id);
        }
        ["grant", user_id, amount] => {
            let amount: i64 = amount.parse().context("amount must be an integer")?;
            let balance = db.credit(user_id, amount, "admin grant")?;
            info!("{} now has {} credits", user_id, balance);
        }
        ["ledger", user_id] => {
            for entry in db.get_ledger(user_id)? {
                println!("{}\t{:+}\t{}", entry.created_at, entry.amount, entry.description);
            }
        }
        _ => bail!("usage: parley [token <user> [name] | add-member <chat> <user> | grant <user> <amount> | ledger <user>]"),
    }
    Ok(())
}

async fn serve(config: ServerConfig, db: Arc<Database>) -> anyhow::Result<()> {
    let backend = Arc::new(SqliteBackend::new(db));
    let dispatcher = Dispatcher::new(backend.clone());
    let limiter = FixedWindowLimiter::new(config.rate_limit_max, config.rate_limit_window.as_secs());

    let orchestrator = SendOrchestrator::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(limiter.clone()),
        dispatcher.clone(),
    );

    let app_state: AppState = Arc::new(AppStateInner {
        store: backend.clone(),
        access: backend.clone(),
        wallet: backend,
        orchestrator,
        dispatcher: dispatcher.clone(),
        jwt_secret: config.jwt_secret.clone(),
    });

    // Expire presence of clients that vanished without leaving
    tokio::spawn(dispatcher::run_presence_sweeper(
        dispatcher.clone(),
        Duration::from_secs(10),
        config.presence_timeout,
    ));

    // Drop counters of closed rate-limit windows
    let rl = limiter.clone();
    let purge_every = config.rate_limit_window.max(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            rl.purge_stale().await;
        }
    });

    // Routes
    let protected_routes = Router::new()
        .route(
            "/chats/{chat_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/chats/{chat_id}/read", post(messages::mark_read))
        .route(
            "/chats/{chat_id}/messages/{message_id}/unlock",
            post(messages::unlock_message),
        )
        .route("/wallet", get(wallet::get_balance))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(app_state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// A missing token is the same 401 as a bad one.
fn gateway_user(secret: &str, query: &GatewayQuery) -> Result<String, ApiError> {
    let token = query.token.as_deref().ok_or(ApiError::Unauthorized)?;
    Ok(decode_token(secret, token)?.sub)
}

/// Browsers cannot set headers on a WebSocket handshake, so the gateway
/// takes its token from the query string and rejects before upgrading.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = gateway_user(&state.jwt_secret, &query)?;
    let dispatcher = state.dispatcher.clone();

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection_authenticated(socket, dispatcher, user_id)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, Uri};

    const SECRET: &str = "test-secret";

    fn query(uri: &str) -> GatewayQuery {
        let uri: Uri = uri.parse().unwrap();
        Query::<GatewayQuery>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn gateway_without_token_is_unauthorized() {
        let err = gateway_user(SECRET, &query("/gateway")).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn gateway_token_names_the_user() {
        let token = auth::create_token(SECRET, "alice", None, chrono::Duration::hours(1)).unwrap();
        let user = gateway_user(SECRET, &query(&format!("/gateway?token={}", token))).unwrap();
        assert_eq!(user, "alice");

        let forged = auth::create_token("other", "alice", None, chrono::Duration::hours(1)).unwrap();
        let err = gateway_user(SECRET, &query(&format!("/gateway?token={}", forged))).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
