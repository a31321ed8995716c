use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// A server-filtered event stream scoped to one chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    /// Inserts of new messages.
    Messages { chat_id: String },
    /// Presence sync/join/leave.
    Presence { chat_id: String },
    /// Typing broadcasts.
    Typing { chat_id: String },
}

impl Topic {
    pub fn chat_id(&self) -> &str {
        match self {
            Self::Messages { chat_id } | Self::Presence { chat_id } | Self::Typing { chat_id } => {
                chat_id
            }
        }
    }

    pub fn messages(chat_id: impl Into<String>) -> Self {
        Self::Messages { chat_id: chat_id.into() }
    }

    pub fn presence(chat_id: impl Into<String>) -> Self {
        Self::Presence { chat_id: chat_id.into() }
    }

    pub fn typing(chat_id: impl Into<String>) -> Self {
        Self::Typing { chat_id: chat_id.into() }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Messages { chat_id } => write!(f, "messages:{}", chat_id),
            Self::Presence { chat_id } => write!(f, "presence:{}", chat_id),
            Self::Typing { chat_id } => write!(f, "typing:{}", chat_id),
        }
    }
}

/// Metadata a client attaches when announcing presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub display_name: Option<String>,
    pub online_at: DateTime<Utc>,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: String },

    /// A subscription was accepted; events for the topic follow.
    Subscribed { topic: Topic },

    /// A subscription was refused (not a participant of the chat).
    SubscribeDenied { topic: Topic, reason: String },

    /// A new message row was inserted
    MessageInsert { message: Message },

    /// Authoritative snapshot of everyone present in a chat
    PresenceSync {
        chat_id: String,
        users: HashMap<String, PresenceMeta>,
    },

    /// A user announced presence (first join or heartbeat)
    PresenceJoin {
        chat_id: String,
        user_id: String,
        meta: PresenceMeta,
    },

    /// A user left or timed out
    PresenceLeave { chat_id: String, user_id: String },

    /// A user is typing
    Typing {
        chat_id: String,
        user_id: String,
        user_name: String,
        timestamp: DateTime<Utc>,
    },
}

impl GatewayEvent {
    /// Returns the topic if this event is scoped to one.
    /// Events that return `None` are connection-level and always delivered.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::MessageInsert { message } => Some(Topic::messages(&message.chat_id)),
            Self::PresenceSync { chat_id, .. }
            | Self::PresenceJoin { chat_id, .. }
            | Self::PresenceLeave { chat_id, .. } => Some(Topic::presence(chat_id)),
            Self::Typing { chat_id, .. } => Some(Topic::typing(chat_id)),
            Self::Ready { .. } | Self::Subscribed { .. } | Self::SubscribeDenied { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving events for a topic. With `echo_self` false the server
    /// never sends this connection's own broadcasts back to it.
    Subscribe {
        topic: Topic,
        #[serde(default)]
        echo_self: bool,
    },

    /// Stop receiving events for a topic
    Unsubscribe { topic: Topic },

    /// Announce (or re-announce, as a heartbeat) presence in a chat
    PresenceTrack {
        chat_id: String,
        display_name: Option<String>,
    },

    /// Withdraw presence from a chat
    PresenceUntrack { chat_id: String },

    /// Broadcast a typing signal
    Typing { chat_id: String, user_name: String },
}
