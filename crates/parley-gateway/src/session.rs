use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::dispatcher::{Broadcast, Dispatcher};

/// Per-connection state: the topics this connection listens to and the chats
/// it announced presence in. Transport-agnostic; the WebSocket connection and
/// the in-process link both drive a session.
pub struct Session {
    dispatcher: Dispatcher,
    user_id: String,
    conn_id: Uuid,
    /// topic -> echo_self
    subscriptions: HashMap<Topic, bool>,
    tracked: HashSet<String>,
}

impl Session {
    pub fn new(dispatcher: Dispatcher, user_id: String) -> Self {
        Self {
            dispatcher,
            user_id,
            conn_id: Uuid::new_v4(),
            subscriptions: HashMap::new(),
            tracked: HashSet::new(),
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Whether a broadcast should be forwarded to this connection.
    pub fn accepts(&self, b: &Broadcast) -> bool {
        let Some(topic) = &b.topic else {
            return true;
        };
        match self.subscriptions.get(topic) {
            Some(&echo_self) => echo_self || b.origin != Some(self.conn_id),
            None => false,
        }
    }

    /// Apply a client command. Direct replies are returned to the caller.
    pub async fn handle_command(&mut self, cmd: GatewayCommand) -> Vec<GatewayEvent> {
        match cmd {
            GatewayCommand::Subscribe { topic, echo_self } => {
                if !self.dispatcher.authorize(topic.chat_id(), &self.user_id).await {
                    warn!("{} denied subscription to {}", self.user_id, topic);
                    return vec![GatewayEvent::SubscribeDenied {
                        topic,
                        reason: "not a participant of this chat".into(),
                    }];
                }

                debug!("{} subscribed to {}", self.user_id, topic);
                self.subscriptions.insert(topic.clone(), echo_self);

                let mut replies = vec![GatewayEvent::Subscribed { topic: topic.clone() }];
                if let Topic::Presence { chat_id } = &topic {
                    let users = self.dispatcher.presence_snapshot(chat_id).await;
                    replies.push(GatewayEvent::PresenceSync {
                        chat_id: chat_id.clone(),
                        users,
                    });
                }
                replies
            }

            GatewayCommand::Unsubscribe { topic } => {
                debug!("{} unsubscribed from {}", self.user_id, topic);
                self.subscriptions.remove(&topic);
                vec![]
            }

            GatewayCommand::PresenceTrack { chat_id, display_name } => {
                if !self.subscriptions.contains_key(&Topic::presence(&chat_id)) {
                    warn!("{} tracked presence in {} without subscribing", self.user_id, chat_id);
                    return vec![];
                }
                self.tracked.insert(chat_id.clone());
                self.dispatcher
                    .presence_track(&chat_id, &self.user_id, display_name, self.conn_id)
                    .await;
                vec![]
            }

            GatewayCommand::PresenceUntrack { chat_id } => {
                if self.tracked.remove(&chat_id) {
                    self.dispatcher
                        .presence_untrack(&chat_id, &self.user_id, self.conn_id)
                        .await;
                }
                vec![]
            }

            GatewayCommand::Typing { chat_id, user_name } => {
                if !self.subscriptions.contains_key(&Topic::typing(&chat_id)) {
                    warn!("{} sent typing to {} without subscribing", self.user_id, chat_id);
                    return vec![];
                }
                self.dispatcher.publish_from(
                    self.conn_id,
                    GatewayEvent::Typing {
                        chat_id,
                        user_id: self.user_id.clone(),
                        user_name,
                        timestamp: chrono::Utc::now(),
                    },
                );
                vec![]
            }
        }
    }

    /// Release everything this connection holds.
    pub async fn close(self) {
        self.dispatcher.presence_drop_connection(self.conn_id).await;
    }
}

/// Drive a session until the command stream ends or the event sink closes.
/// Presence held by the session is released on every exit path.
pub async fn run_session(
    dispatcher: Dispatcher,
    user_id: String,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
    events: mpsc::UnboundedSender<GatewayEvent>,
) {
    let mut broadcast_rx = dispatcher.subscribe();
    let mut session = Session::new(dispatcher, user_id);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                let replies = session.handle_command(cmd).await;
                if replies.into_iter().any(|reply| events.send(reply).is_err()) {
                    break;
                }
            }
            result = broadcast_rx.recv() => {
                let b = match result {
                    Ok(b) => b,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast receiver lagged by {} messages", n);
                        continue;
                    }
                    Err(_) => break,
                };

                if !session.accepts(&b) {
                    continue;
                }
                if events.send(b.event).is_err() {
                    break;
                }
            }
        }
    }

    info!("session {} for {} closed", session.conn_id(), session.user_id);
    session.close().await;
}
