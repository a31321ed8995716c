use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::trace;

use parley_types::events::{GatewayEvent, Topic};
use parley_types::models::Message;

use crate::channel::{ChannelTask, ConnectionState, TopicHandler};
use crate::config::ClientConfig;
use crate::transport::Transport;

struct InsertHandler {
    chat_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl TopicHandler for InsertHandler {
    fn topic(&self) -> Topic {
        Topic::messages(&self.chat_id)
    }

    fn on_event(&mut self, event: GatewayEvent) {
        if let GatewayEvent::MessageInsert { message } = event {
            trace!("insert {} in {}", message.id, self.chat_id);
            let _ = self.tx.send(message);
        }
    }
}

/// Live stream of messages inserted into one chat.
///
/// Delivery is at-least-once: a reconnect or a duplicated broadcast can
/// yield the same message twice, so consumers deduplicate by id.
pub struct MessageChannel {
    chat_id: String,
    task: ChannelTask,
    messages: mpsc::UnboundedReceiver<Message>,
    closed: bool,
}

impl MessageChannel {
    pub fn subscribe(
        transport: Arc<dyn Transport>,
        chat_id: impl Into<String>,
        config: &ClientConfig,
    ) -> Self {
        let chat_id = chat_id.into();
        let (tx, messages) = mpsc::unbounded_channel();
        let handler = InsertHandler {
            chat_id: chat_id.clone(),
            tx,
        };

        Self {
            task: ChannelTask::spawn(transport, handler, config),
            chat_id,
            messages,
            closed: false,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Next inserted message. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.closed {
            return None;
        }
        self.messages.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        self.task.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.task.watch_state()
    }

    /// Stop the subscription and discard anything still queued. Safe to
    /// call more than once.
    pub async fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.task.close().await;
        self.messages.close();
        while self.messages.try_recv().is_ok() {}
    }
}
