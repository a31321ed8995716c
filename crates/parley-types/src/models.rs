use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of chat message. Each kind carries a fixed send cost in credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    /// Media behind a paywall. The receiver pays on unlock, so sending is free.
    PaidMedia,
}

impl MessageKind {
    /// Credits debited from the sender's wallet when a message of this kind is sent.
    pub fn send_cost(self) -> i64 {
        match self {
            Self::Text => 1,
            Self::Image => 2,
            Self::Video => 5,
            Self::PaidMedia => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::PaidMedia => "paid_media",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageKind(pub String);

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownMessageKind {}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "paid_media" => Ok(Self::PaidMedia),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

/// A persisted chat message.
///
/// Messages are immutable once created, except for `read_at` and appends to
/// `unlocked_by`. `created_at` is the authoritative ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub price: Option<i64>,
    #[serde(default)]
    pub unlocked_by: Vec<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    /// Paid media is visible to its sender and to anyone who unlocked it.
    /// Every other kind is always visible.
    pub fn is_unlocked_for(&self, user_id: &str) -> bool {
        self.kind != MessageKind::PaidMedia
            || self.sender_id == user_id
            || self.unlocked_by.iter().any(|u| u == user_id)
    }

    /// Ordering key used everywhere messages are merged: timestamp first,
    /// id as a tie-breaker so equal timestamps still order deterministically.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Content of a message the user is composing. Sender and chat are supplied
/// by the caller at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub price: Option<i64>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: Some(content.into()),
            media_url: None,
            price: None,
        }
    }

    pub fn media(kind: MessageKind, media_url: impl Into<String>) -> Self {
        Self {
            kind,
            content: None,
            media_url: Some(media_url.into()),
            price: None,
        }
    }

    pub fn paid_media(media_url: impl Into<String>, price: i64) -> Self {
        Self {
            kind: MessageKind::PaidMedia,
            content: None,
            media_url: Some(media_url.into()),
            price: Some(price),
        }
    }

    /// Check the draft's fields against its kind.
    pub fn validate(&self) -> Result<(), String> {
        let has_content = self.content.as_deref().is_some_and(|c| !c.trim().is_empty());
        let has_media = self.media_url.as_deref().is_some_and(|m| !m.trim().is_empty());

        match self.kind {
            MessageKind::Text if !has_content => {
                return Err("text messages need content".into());
            }
            MessageKind::Image | MessageKind::Video | MessageKind::PaidMedia if !has_media => {
                return Err(format!("{} messages need a media reference", self.kind));
            }
            _ => {}
        }

        match (self.kind, self.price) {
            (MessageKind::PaidMedia, Some(p)) if p > 0 => Ok(()),
            (MessageKind::PaidMedia, _) => Err("paid media needs a positive price".into()),
            (_, Some(_)) => Err(format!("{} messages cannot carry a price", self.kind)),
            (_, None) => Ok(()),
        }
    }

    pub fn into_new_message(self, chat_id: &str, sender_id: &str) -> NewMessage {
        NewMessage {
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            kind: self.kind,
            content: self.content,
            media_url: self.media_url,
            price: self.price,
        }
    }
}

/// Insert parameters for the authoritative message store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub price: Option<i64>,
}

/// A message held in the device-local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub message: Message,
    /// Denormalized from `message.chat_id` for indexed lookup.
    pub chat_id: String,
    pub cached_at: DateTime<Utc>,
}

/// Per-chat, per-device sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSyncMetadata {
    pub chat_id: String,
    /// Incremental-fetch lower bound. Never moves backwards.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub schema_version: u32,
}

/// Ephemeral "user is typing" signal. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingSignal {
    pub user_id: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Ephemeral presence entry. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_costs_follow_kind() {
        assert_eq!(MessageKind::Text.send_cost(), 1);
        assert_eq!(MessageKind::Image.send_cost(), 2);
        assert_eq!(MessageKind::Video.send_cost(), 5);
        assert_eq!(MessageKind::PaidMedia.send_cost(), 0);
    }

    #[test]
    fn kind_parses_its_own_name() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::Video,
            MessageKind::PaidMedia,
        ] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("gif".parse::<MessageKind>().is_err());
    }

    #[test]
    fn message_serializes_kind_as_type() {
        let msg = Message {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "u1".into(),
            kind: MessageKind::PaidMedia,
            content: None,
            media_url: Some("media/x.jpg".into()),
            price: Some(10),
            unlocked_by: vec![],
            read_at: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "paid_media");
    }

    #[test]
    fn draft_validation() {
        assert!(MessageDraft::text("hi").validate().is_ok());
        assert!(MessageDraft::text("   ").validate().is_err());
        assert!(MessageDraft::media(MessageKind::Image, "a.png").validate().is_ok());
        assert!(MessageDraft::media(MessageKind::Video, "").validate().is_err());
        assert!(MessageDraft::paid_media("a.png", 25).validate().is_ok());
        assert!(MessageDraft::paid_media("a.png", 0).validate().is_err());

        let mut priced_text = MessageDraft::text("hi");
        priced_text.price = Some(3);
        assert!(priced_text.validate().is_err());
    }

    #[test]
    fn paid_media_visibility() {
        let msg = Message {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "creator".into(),
            kind: MessageKind::PaidMedia,
            content: None,
            media_url: Some("v.mp4".into()),
            price: Some(5),
            unlocked_by: vec!["fan".into()],
            read_at: None,
            created_at: Utc::now(),
        };
        assert!(msg.is_unlocked_for("creator"));
        assert!(msg.is_unlocked_for("fan"));
        assert!(!msg.is_unlocked_for("lurker"));
    }
}
