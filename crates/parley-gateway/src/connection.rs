use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::session::run_session;

/// The server pings at this cadence and drops the socket after
/// `MAX_MISSED_PONGS` unanswered pings in a row.
const PING_INTERVAL: Duration = Duration::from_secs(15);
const MAX_MISSED_PONGS: u8 = 2;

/// Bridge an upgraded socket to a gateway session. The token was verified
/// during the upgrade; the first frame sent is `Ready`.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    dispatcher: Dispatcher,
    user_id: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} connected to gateway", user_id);

    let ready = GatewayEvent::Ready { user_id: user_id.clone() };
    let Ok(text) = serde_json::to_string(&ready) else {
        return;
    };
    if sender.send(Message::Text(text.into())).await.is_err() {
        return;
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel::<GatewayCommand>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let session_task = tokio::spawn(run_session(dispatcher, user_id.clone(), command_rx, event_tx));

    let alive = Arc::new(AtomicBool::new(true));
    let alive_writer = alive.clone();

    // Writer: session events out, pings on the side.
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        let mut missed: u8 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode gateway event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if alive_writer.swap(false, Ordering::Acquire) {
                        missed = 0;
                    } else {
                        missed += 1;
                        if missed >= MAX_MISSED_PONGS {
                            warn!("No pong for {} pings, dropping gateway socket", missed);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: client commands in. Ending drops `command_tx`, which closes
    // the session.
    let reader_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if command_tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{} sent an unparseable command: {}", reader_user, e),
                },
                Message::Pong(_) => {
                    alive.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Either half ending tears down the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Err(e) = session_task.await {
        warn!("session task for {} ended abnormally: {}", user_id, e);
    }
    info!("{} disconnected from gateway", user_id);
}
