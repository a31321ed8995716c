//! The rendered conversation: confirmed messages merged with optimistic
//! local sends, ordered by `(created_at, id)` and unique by id.

use chrono::Utc;
use uuid::Uuid;

use parley_types::models::{Message, MessageDraft};

pub const PROVISIONAL_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryStatus {
    Composing,
    Sending,
    Failed,
    /// Accepted by the server. Own messages stay here until the store
    /// reports them read.
    Sent,
    /// Another participant's message, received from the store or the
    /// realtime channel.
    Delivered,
    /// The store carries a `read_at`.
    Read,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: Message,
    pub status: DeliveryStatus,
    /// Draft kept for retrying a failed send.
    pub draft: Option<MessageDraft>,
    pub error: Option<String>,
}

impl TimelineEntry {
    pub fn is_provisional(&self) -> bool {
        self.message.id.starts_with(PROVISIONAL_PREFIX)
    }
}

/// What a merge did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Inserted,
    /// Already present; mutable fields were refreshed.
    Updated,
    /// Already present and unchanged.
    Duplicate,
}

#[derive(Debug)]
pub struct Timeline {
    chat_id: String,
    me: String,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(chat_id: impl Into<String>, me: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            me: me.into(),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TimelineEntry> {
        self.entries.iter().find(|e| e.message.id == id)
    }

    /// Oldest confirmed message, the anchor for loading history.
    pub fn oldest_confirmed(&self) -> Option<&Message> {
        self.entries
            .iter()
            .find(|e| !e.is_provisional())
            .map(|e| &e.message)
    }

    /// Newest confirmed message, the anchor for catching up.
    pub fn newest_confirmed(&self) -> Option<&Message> {
        self.entries
            .iter()
            .rev()
            .find(|e| !e.is_provisional())
            .map(|e| &e.message)
    }

    /// Merge confirmed messages from the cache, the store or the realtime
    /// channel. Arrival order does not matter.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.merge_one(message) == Merge::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn merge_one(&mut self, message: Message) -> Merge {
        if message.chat_id != self.chat_id {
            return Merge::Duplicate;
        }

        let floor = if message.sender_id == self.me {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Delivered
        };
        let status = self.confirmed_status(&message, floor);
        if let Some(pos) = self.position(&message.id) {
            let entry = &mut self.entries[pos];
            let status = entry.status.max(status);
            if entry.message == message && entry.status == status {
                return Merge::Duplicate;
            }
            entry.message.read_at = message.read_at.or(entry.message.read_at);
            entry.message.unlocked_by = message.unlocked_by;
            entry.status = status;
            return Merge::Updated;
        }

        self.insert_sorted(TimelineEntry {
            message,
            status,
            draft: None,
            error: None,
        });
        Merge::Inserted
    }

    /// Render a draft the user is still composing. Returns its provisional id.
    pub fn stage(&mut self, draft: MessageDraft) -> String {
        let id = format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4());
        let message = Message {
            id: id.clone(),
            chat_id: self.chat_id.clone(),
            sender_id: self.me.clone(),
            kind: draft.kind,
            content: draft.content.clone(),
            media_url: draft.media_url.clone(),
            price: draft.price,
            unlocked_by: Vec::new(),
            read_at: None,
            created_at: Utc::now(),
        };
        self.insert_sorted(TimelineEntry {
            message,
            status: DeliveryStatus::Composing,
            draft: Some(draft),
            error: None,
        });
        id
    }

    /// Move a staged or failed entry to `Sending`. Returns its draft.
    pub fn mark_sending(&mut self, provisional_id: &str) -> Option<MessageDraft> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == provisional_id)?;
        if !matches!(entry.status, DeliveryStatus::Composing | DeliveryStatus::Failed) {
            return None;
        }
        entry.status = DeliveryStatus::Sending;
        entry.error = None;
        entry.draft.clone()
    }

    /// Stage and mark sending in one step.
    pub fn begin_send(&mut self, draft: MessageDraft) -> String {
        let id = self.stage(draft);
        self.mark_sending(&id);
        id
    }

    /// Swap the provisional entry for the server's canonical row. If the
    /// realtime echo already delivered that row, the provisional entry is
    /// simply dropped.
    pub fn confirm(&mut self, provisional_id: &str, message: Message) {
        let Some(pos) = self.position(provisional_id) else {
            self.merge_one(message);
            return;
        };
        self.entries.remove(pos);

        if let Some(existing) = self.position(&message.id) {
            let entry = &mut self.entries[existing];
            entry.status = entry.status.max(DeliveryStatus::Sent);
            return;
        }

        let status = self.confirmed_status(&message, DeliveryStatus::Sent);
        self.insert_sorted(TimelineEntry {
            message,
            status,
            draft: None,
            error: None,
        });
    }

    /// Keep the entry visible with its error so the user can retry.
    pub fn fail(&mut self, provisional_id: &str, error: impl Into<String>) {
        if let Some(pos) = self.position(provisional_id) {
            let entry = &mut self.entries[pos];
            entry.status = DeliveryStatus::Failed;
            entry.error = Some(error.into());
        }
    }

    pub fn discard(&mut self, provisional_id: &str) -> bool {
        match self.position(provisional_id) {
            Some(pos) if self.entries[pos].is_provisional() => {
                self.entries.remove(pos);
                true
            }
            _ => false,
        }
    }

    fn confirmed_status(&self, message: &Message, floor: DeliveryStatus) -> DeliveryStatus {
        if message.read_at.is_some() {
            DeliveryStatus::Read
        } else {
            floor
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn insert_sorted(&mut self, entry: TimelineEntry) {
        let key = entry.message.sort_key();
        let pos = self
            .entries
            .partition_point(|e| e.message.sort_key() <= key);
        self.entries.insert(pos, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parley_types::models::MessageKind;

    fn msg(id: &str, sender: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            chat_id: "chat-1".into(),
            sender_id: sender.into(),
            kind: MessageKind::Text,
            content: Some(id.into()),
            media_url: None,
            price: None,
            unlocked_by: vec![],
            read_at: None,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn ids(t: &Timeline) -> Vec<&str> {
        t.entries().iter().map(|e| e.message.id.as_str()).collect()
    }

    #[test]
    fn duplicate_inserts_render_once() {
        let mut t = Timeline::new("chat-1", "alice");
        assert_eq!(t.merge_one(msg("m1", "bob", 100)), Merge::Inserted);
        assert_eq!(t.merge_one(msg("m1", "bob", 100)), Merge::Duplicate);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn out_of_order_arrivals_are_sorted() {
        let mut t = Timeline::new("chat-1", "alice");
        t.merge(vec![msg("c", "bob", 300), msg("a", "bob", 100)]);
        t.merge_one(msg("b", "bob", 200));
        assert_eq!(ids(&t), vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut t = Timeline::new("chat-1", "alice");
        t.merge(vec![msg("y", "bob", 100), msg("x", "bob", 100)]);
        assert_eq!(ids(&t), vec!["x", "y"]);
    }

    #[test]
    fn confirmation_replaces_provisional_entry() {
        let mut t = Timeline::new("chat-1", "alice");
        let local = t.begin_send(MessageDraft::text("hi"));
        assert_eq!(t.get(&local).unwrap().status, DeliveryStatus::Sending);

        let canonical = msg("srv-1", "alice", 100);
        t.confirm(&local, canonical);
        assert!(t.get(&local).is_none());
        assert_eq!(t.get("srv-1").unwrap().status, DeliveryStatus::Sent);

        // Seeing our own row again from the store changes nothing.
        assert_eq!(t.merge_one(msg("srv-1", "alice", 100)), Merge::Duplicate);
        assert_eq!(t.get("srv-1").unwrap().status, DeliveryStatus::Sent);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn stored_row_before_confirmation_drops_provisional() {
        let mut t = Timeline::new("chat-1", "alice");
        let local = t.begin_send(MessageDraft::text("hi"));
        t.merge_one(msg("srv-1", "alice", 100));
        assert_eq!(t.len(), 2);

        t.confirm(&local, msg("srv-1", "alice", 100));
        assert_eq!(ids(&t), vec!["srv-1"]);
        assert_eq!(t.get("srv-1").unwrap().status, DeliveryStatus::Sent);
    }

    #[test]
    fn delivery_status_depends_on_sender() {
        let mut t = Timeline::new("chat-1", "alice");
        t.merge(vec![msg("mine", "alice", 100), msg("theirs", "bob", 200)]);
        assert_eq!(t.get("mine").unwrap().status, DeliveryStatus::Sent);
        assert_eq!(t.get("theirs").unwrap().status, DeliveryStatus::Delivered);
    }

    #[test]
    fn failed_send_can_be_retried() {
        let mut t = Timeline::new("chat-1", "alice");
        let local = t.begin_send(MessageDraft::text("hi"));
        t.fail(&local, "rate limited");

        let entry = t.get(&local).unwrap();
        assert_eq!(entry.status, DeliveryStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("rate limited"));

        let draft = t.mark_sending(&local).unwrap();
        assert_eq!(draft, MessageDraft::text("hi"));
        assert!(t.mark_sending(&local).is_none());
        assert!(t.discard(&local));
        assert!(t.is_empty());
    }

    #[test]
    fn read_at_upgrades_status() {
        let mut t = Timeline::new("chat-1", "alice");
        t.merge_one(msg("m1", "alice", 100));
        let mut read = msg("m1", "alice", 100);
        read.read_at = Some(Utc.timestamp_opt(150, 0).unwrap());
        t.merge_one(read);
        assert_eq!(t.get("m1").unwrap().status, DeliveryStatus::Read);
    }
}
