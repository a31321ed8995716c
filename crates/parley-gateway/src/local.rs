use tokio::sync::mpsc;

use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::session::run_session;

/// Both ends of an in-process gateway connection.
pub struct LocalLink {
    pub commands: mpsc::UnboundedSender<GatewayCommand>,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
}

/// Open a gateway session without a socket, for embedding the gateway in the
/// same process as its clients. Behaves like an authenticated WebSocket
/// connection: the first event is `Ready`, and dropping `commands` closes the
/// session and releases its presence.
pub fn connect_local(dispatcher: Dispatcher, user_id: impl Into<String>) -> LocalLink {
    let user_id = user_id.into();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let _ = event_tx.send(GatewayEvent::Ready { user_id: user_id.clone() });
    tokio::spawn(run_session(dispatcher, user_id, command_rx, event_tx));

    LocalLink {
        commands: command_tx,
        events: event_rx,
    }
}
