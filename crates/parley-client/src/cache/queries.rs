use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::debug;

use parley_types::models::{CachedMessage, ChatSyncMetadata, Message};
use parley_types::time;

use super::MessageCache;
use super::migrations::SCHEMA_VERSION;
use crate::error::{CacheError, CacheResult};

impl MessageCache {
    /// Upsert a batch of messages for a chat in one transaction. Returns the
    /// number of messages that were not cached before.
    pub fn put(&self, chat_id: &str, messages: &[Message]) -> CacheResult<usize> {
        self.put_at(chat_id, messages, time::now())
    }

    /// `put` with an explicit cache timestamp.
    ///
    /// An existing row keeps its original `cached_at`; only the payload is
    /// refreshed, which carries the mutable `read_at` and `unlocked_by`.
    pub fn put_at(
        &self,
        chat_id: &str,
        messages: &[Message],
        cached_at: DateTime<Utc>,
    ) -> CacheResult<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let cached_at = time::encode(cached_at);
            let mut inserted = 0;

            {
                let mut exists = tx.prepare("SELECT 1 FROM cached_messages WHERE id = ?1")?;
                let mut upsert = tx.prepare(
                    "INSERT INTO cached_messages (id, chat_id, created_at, cached_at, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
                )?;

                for message in messages {
                    if message.chat_id != chat_id {
                        debug!("Skipping {} from {} while caching {}", message.id, message.chat_id, chat_id);
                        continue;
                    }
                    let payload = serde_json::to_string(message)
                        .map_err(|e| CacheError::Corrupt(e.to_string()))?;

                    if !exists.exists([&message.id])? {
                        inserted += 1;
                    }
                    upsert.execute(rusqlite::params![
                        message.id,
                        chat_id,
                        time::encode(message.created_at),
                        cached_at,
                        payload,
                    ])?;
                }
            }

            refresh_meta(&tx, chat_id)?;
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Newest first. `before` is exclusive.
    pub fn get(
        &self,
        chat_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> CacheResult<Vec<Message>> {
        self.with_conn(|conn| {
            let before = before.map(time::encode);
            let mut stmt = conn.prepare(
                "SELECT payload FROM cached_messages
                 WHERE chat_id = ?1 AND (?2 IS NULL OR created_at < ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;

            let payloads = stmt
                .query_map(rusqlite::params![chat_id, before, limit], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            payloads.iter().map(|p| decode_payload(p)).collect()
        })
    }

    pub fn get_entry(&self, message_id: &str) -> CacheResult<Option<CachedMessage>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT chat_id, cached_at, payload FROM cached_messages WHERE id = ?1",
                    [message_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(chat_id, cached_at, payload)| {
                Ok(CachedMessage {
                    message: decode_payload(&payload)?,
                    chat_id,
                    cached_at: decode_ts(&cached_at)?,
                })
            })
            .transpose()
        })
    }

    /// Lower bound for the next incremental fetch. Chats that were never
    /// synced fall back to the newest cached message.
    pub fn sync_cursor(&self, chat_id: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let cursor: Option<Option<String>> = conn
                .query_row(
                    "SELECT COALESCE(last_sync_at, last_message_at)
                     FROM chat_sync_meta WHERE chat_id = ?1",
                    [chat_id],
                    |row| row.get(0),
                )
                .optional()?;

            cursor.flatten().as_deref().map(decode_ts).transpose()
        })
    }

    /// Move the cursor forward. Older values are ignored.
    pub fn advance_sync_cursor(&self, chat_id: &str, at: DateTime<Utc>) -> CacheResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sync_meta (chat_id, last_sync_at, schema_version)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    last_sync_at = MAX(COALESCE(last_sync_at, ''), excluded.last_sync_at)",
                rusqlite::params![chat_id, time::encode(at), SCHEMA_VERSION],
            )?;
            Ok(())
        })
    }

    pub fn metadata(&self, chat_id: &str) -> CacheResult<Option<ChatSyncMetadata>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT last_sync_at, last_message_id, last_message_at, message_count, schema_version
                     FROM chat_sync_meta WHERE chat_id = ?1",
                    [chat_id],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, u32>(4)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(last_sync_at, last_message_id, last_message_at, count, schema_version)| {
                Ok(ChatSyncMetadata {
                    chat_id: chat_id.to_string(),
                    last_sync_at: last_sync_at.as_deref().map(decode_ts).transpose()?,
                    last_message_id,
                    last_message_at: last_message_at.as_deref().map(decode_ts).transpose()?,
                    message_count: count.max(0) as u64,
                    schema_version,
                })
            })
            .transpose()
        })
    }

    /// Chats that have cached messages or a sync cursor.
    pub fn known_chats(&self) -> CacheResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id FROM cached_messages
                 UNION
                 SELECT chat_id FROM chat_sync_meta
                 ORDER BY 1",
            )?;
            let chats = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(chats)
        })
    }

    /// Delete messages cached longer than `retention` ago, sparing the
    /// newest `keep_recent` messages of every chat.
    pub fn evict_older_than(&self, retention: Duration, keep_recent: u32) -> CacheResult<usize> {
        self.evict_older_than_at(retention, keep_recent, Utc::now())
    }

    pub fn evict_older_than_at(
        &self,
        retention: Duration,
        keep_recent: u32,
        now: DateTime<Utc>,
    ) -> CacheResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM cached_messages
                 WHERE cached_at < ?1
                   AND id NOT IN (
                       SELECT id FROM (
                           SELECT id, ROW_NUMBER() OVER (
                               PARTITION BY chat_id ORDER BY created_at DESC, id DESC
                           ) AS rn
                           FROM cached_messages
                       ) WHERE rn <= ?2
                   )",
                rusqlite::params![time::encode(cutoff), keep_recent],
            )?;

            if deleted > 0 {
                let chats = tx
                    .prepare("SELECT chat_id FROM chat_sync_meta")?
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                for chat_id in chats {
                    refresh_meta(&tx, &chat_id)?;
                }
            }

            tx.commit()?;
            Ok(deleted)
        })
    }

    /// Keep at most `max` messages for a chat, deleting the oldest-cached first.
    pub fn cap_per_chat(&self, chat_id: &str, max: u32) -> CacheResult<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM cached_messages
                 WHERE chat_id = ?1
                   AND id NOT IN (
                       SELECT id FROM cached_messages
                       WHERE chat_id = ?1
                       ORDER BY cached_at DESC, created_at DESC, id DESC
                       LIMIT ?2
                   )",
                rusqlite::params![chat_id, max],
            )?;
            if deleted > 0 {
                refresh_meta(&tx, chat_id)?;
            }
            tx.commit()?;
            Ok(deleted)
        })
    }

    pub fn flag(&self, key: &str) -> CacheResult<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM cache_flags WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    pub fn set_flag(&self, key: &str, value: &str) -> CacheResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_flags (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                (key, value),
            )?;
            Ok(())
        })
    }
}

/// Recompute count and newest message for a chat from its rows.
fn refresh_meta(tx: &Transaction<'_>, chat_id: &str) -> CacheResult<()> {
    let conn: &Connection = tx;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cached_messages WHERE chat_id = ?1",
        [chat_id],
        |row| row.get(0),
    )?;
    let newest: Option<(String, String)> = conn
        .query_row(
            "SELECT id, created_at FROM cached_messages WHERE chat_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [chat_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (last_id, last_at) = newest.unzip();

    conn.execute(
        "INSERT INTO chat_sync_meta (chat_id, last_message_id, last_message_at, message_count, schema_version)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(chat_id) DO UPDATE SET
            last_message_id = excluded.last_message_id,
            last_message_at = excluded.last_message_at,
            message_count = excluded.message_count,
            schema_version = excluded.schema_version",
        rusqlite::params![chat_id, last_id, last_at, count, SCHEMA_VERSION],
    )?;
    Ok(())
}

fn decode_payload(payload: &str) -> CacheResult<Message> {
    serde_json::from_str(payload).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn decode_ts(s: &str) -> CacheResult<DateTime<Utc>> {
    time::decode(s).map_err(|e| CacheError::Corrupt(format!("{}: {}", s, e)))
}
