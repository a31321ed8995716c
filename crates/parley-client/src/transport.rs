use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::error::ClientError;

/// One live gateway connection. Dropping `commands` closes it; `events`
/// ends when the server side goes away.
pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<GatewayCommand>,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
}

/// Opens gateway connections. Every channel holds its own link so channels
/// fail and reconnect independently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<TransportLink, ClientError>;
}

/// Gateway over a WebSocket. The token travels in the query string because
/// the handshake cannot carry an Authorization header from every runtime.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<TransportLink, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Transport(format!("WS connect failed: {}", e)))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<GatewayCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Outbound: commands until the link owner hangs up, then a close frame.
        tokio::spawn(async move {
            while let Some(cmd) = command_rx.recv().await {
                let json = match serde_json::to_string(&cmd) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode gateway command: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Inbound: events until the socket closes or the link is dropped.
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<GatewayEvent>(text.as_str()) {
                            Ok(event) => {
                                trace!("gateway event: {:?}", event);
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Unparseable gateway event: {}", e),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Gateway socket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            commands: command_tx,
            events: event_rx,
        })
    }
}
