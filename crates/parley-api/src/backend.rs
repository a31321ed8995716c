//! SQLite-backed collaborators. Every call runs on the blocking pool so the
//! connection mutex never stalls the async runtime.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use parley_db::Database;
use parley_types::api::MessageQuery;
use parley_types::models::{Message, NewMessage};
use parley_types::ports::{
    BackendError, BackendResult, ChatAccess, Debit, MessageStore, Unlocked, Wallet,
};
use parley_types::time;

#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<Database>,
}

impl SqliteBackend {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                BackendError::Unavailable(e.to_string())
            })?
            .map_err(BackendError::from)
    }
}

#[async_trait]
impl MessageStore for SqliteBackend {
    async fn fetch(&self, chat_id: &str, query: &MessageQuery) -> BackendResult<Vec<Message>> {
        let chat_id = chat_id.to_string();
        let after = query.after.map(time::encode);
        let before = query.before.map(time::encode);
        let limit = query.clamped_limit();
        self.blocking(move |db| {
            db.get_messages(&chat_id, after.as_deref(), before.as_deref(), limit)
        })
        .await
    }

    async fn get(&self, message_id: &str) -> BackendResult<Message> {
        let message_id = message_id.to_string();
        self.blocking(move |db| db.get_message(&message_id))
            .await?
            .ok_or(BackendError::NotFound)
    }

    async fn insert(&self, message: NewMessage) -> BackendResult<Message> {
        self.blocking(move |db| db.insert_message(&message)).await
    }

    async fn mark_read(&self, chat_id: &str, reader_id: &str) -> BackendResult<usize> {
        let chat_id = chat_id.to_string();
        let reader_id = reader_id.to_string();
        self.blocking(move |db| db.mark_read(&chat_id, &reader_id)).await
    }

    async fn append_unlock(&self, message_id: &str, user_id: &str) -> BackendResult<Unlocked> {
        let message_id = message_id.to_string();
        let user_id = user_id.to_string();
        let (inserted, message) = self
            .blocking(move |db| {
                let inserted = db.append_unlock(&message_id, &user_id)?;
                Ok((inserted, db.get_message(&message_id)?))
            })
            .await?;
        Ok(Unlocked {
            message: message.ok_or(BackendError::NotFound)?,
            inserted,
        })
    }
}

#[async_trait]
impl ChatAccess for SqliteBackend {
    async fn is_participant(&self, chat_id: &str, user_id: &str) -> BackendResult<bool> {
        let chat_id = chat_id.to_string();
        let user_id = user_id.to_string();
        self.blocking(move |db| db.is_participant(&chat_id, &user_id)).await
    }
}

#[async_trait]
impl Wallet for SqliteBackend {
    async fn balance(&self, user_id: &str) -> BackendResult<i64> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.get_balance(&user_id)).await
    }

    async fn debit(&self, user_id: &str, amount: i64, description: &str) -> BackendResult<Debit> {
        let user_id = user_id.to_string();
        let description = description.to_string();
        self.blocking(move |db| {
            Ok(match db.debit(&user_id, amount, &description)? {
                Some(new_balance) => Debit::Applied { new_balance },
                None => Debit::Insufficient {
                    balance: db.get_balance(&user_id)?,
                },
            })
        })
        .await
    }

    async fn credit(&self, user_id: &str, amount: i64, description: &str) -> BackendResult<i64> {
        let user_id = user_id.to_string();
        let description = description.to_string();
        self.blocking(move |db| db.credit(&user_id, amount, &description)).await
    }
}
