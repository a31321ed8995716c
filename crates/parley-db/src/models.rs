use anyhow::{Context, Result};
use parley_types::models::{Message, MessageKind};
use parley_types::time;

/// Database row types. These map directly to SQLite rows.
/// Distinct from parley-types models to keep the DB layer independent.
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub kind: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub price: Option<i64>,
    pub read_at: Option<String>,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_message(self, unlocked_by: Vec<String>) -> Result<Message> {
        let kind: MessageKind = self
            .kind
            .parse()
            .with_context(|| format!("message {} has a corrupt kind", self.id))?;
        let created_at = time::decode(&self.created_at)
            .with_context(|| format!("message {} has a corrupt created_at", self.id))?;
        let read_at = self
            .read_at
            .as_deref()
            .map(time::decode)
            .transpose()
            .with_context(|| format!("message {} has a corrupt read_at", self.id))?;

        Ok(Message {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            kind,
            content: self.content,
            media_url: self.media_url,
            price: self.price,
            unlocked_by,
            read_at,
            created_at,
        })
    }
}

pub struct LedgerRow {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub description: String,
    pub created_at: String,
}
