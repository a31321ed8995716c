use std::collections::HashMap;

use crate::Database;
use crate::models::{LedgerRow, MessageRow};
use anyhow::{Result, anyhow};
use parley_types::models::{Message, NewMessage};
use parley_types::time;
use rusqlite::Connection;
use uuid::Uuid;

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, kind, content, media_url, price, read_at, created_at";

impl Database {
    // -- Chats --

    pub fn create_chat(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("INSERT OR IGNORE INTO chats (id) VALUES (?1)", [id])?;
            Ok(())
        })
    }

    pub fn add_participant(&self, chat_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO chat_participants (chat_id, user_id) VALUES (?1, ?2)",
                (chat_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn is_participant(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
                    (chat_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Messages --

    /// Insert a message with a server-assigned id and timestamp.
    ///
    /// `created_at` is strictly greater than every timestamp already stored
    /// for the chat, even if the clock steps backwards, so an exclusive
    /// `after` cursor can never skip a row.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let newest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE chat_id = ?1",
                [&new.chat_id],
                |row| row.get(0),
            )?;
            let mut created_at = time::now();
            if let Some(newest) = newest.as_deref().map(time::decode).transpose()? {
                if newest >= created_at {
                    created_at = newest + chrono::Duration::microseconds(1);
                }
            }

            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender_id, kind, content, media_url, price, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id,
                    new.chat_id,
                    new.sender_id,
                    new.kind.as_str(),
                    new.content,
                    new.media_url,
                    new.price,
                    time::encode(created_at),
                ],
            )?;
            tx.commit()?;

            Ok(Message {
                id,
                chat_id: new.chat_id.clone(),
                sender_id: new.sender_id.clone(),
                kind: new.kind,
                content: new.content.clone(),
                media_url: new.media_url.clone(),
                price: new.price,
                unlocked_by: vec![],
                read_at: None,
                created_at,
            })
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id],
                    map_message_row,
                )
                .optional()?;

            match row {
                Some(row) => {
                    let mut unlocks = query_unlocks(conn, &[row.id.clone()])?;
                    let unlocked_by = unlocks.remove(&row.id).unwrap_or_default();
                    Ok(Some(row.into_message(unlocked_by)?))
                }
                None => Ok(None),
            }
        })
    }

    /// Messages for a chat in ascending `created_at` order. `after` and
    /// `before` are exclusive. Without `after`, the page closest to `before`
    /// (or the newest page) is returned, for opening a chat and scrolling
    /// back through history.
    pub fn get_messages(
        &self,
        chat_id: &str,
        after: Option<&str>,
        before: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let rows = query_messages(conn, chat_id, after, before, limit)?;
            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let mut unlocks = query_unlocks(conn, &ids)?;

            rows.into_iter()
                .map(|row| {
                    let unlocked_by = unlocks.remove(&row.id).unwrap_or_default();
                    row.into_message(unlocked_by)
                })
                .collect()
        })
    }

    /// Stamp `read_at` on unread messages in the chat that `reader_id` did not send.
    pub fn mark_read(&self, chat_id: &str, reader_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET read_at = ?3
                 WHERE chat_id = ?1 AND sender_id != ?2 AND read_at IS NULL",
                (chat_id, reader_id, time::encode(time::now())),
            )?;
            Ok(updated)
        })
    }

    /// Returns true when the unlock was newly recorded.
    pub fn append_unlock(&self, message_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO message_unlocks (message_id, user_id) VALUES (?1, ?2)",
                (message_id, user_id),
            )?;
            Ok(inserted > 0)
        })
    }

    // -- Wallets --

    pub fn get_balance(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| query_balance(conn, user_id))
    }

    pub fn set_balance(&self, user_id: &str, balance: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO wallets (user_id, balance) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance",
                (user_id, balance),
            )?;
            Ok(())
        })
    }

    /// Atomically debit `amount`. Returns `Ok(None)` without side effects
    /// when the balance is insufficient.
    pub fn debit(&self, user_id: &str, amount: i64, description: &str) -> Result<Option<i64>> {
        if amount < 0 {
            return Err(anyhow!("negative debit {} for {}", amount, user_id));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE wallets SET balance = balance - ?2 WHERE user_id = ?1 AND balance >= ?2",
                (user_id, amount),
            )?;
            if updated == 0 {
                return Ok(None);
            }
            tx.execute(
                "INSERT INTO wallet_ledger (user_id, amount, description) VALUES (?1, ?2, ?3)",
                (user_id, -amount, description),
            )?;
            let balance = query_balance(&tx, user_id)?;
            tx.commit()?;
            Ok(Some(balance))
        })
    }

    pub fn credit(&self, user_id: &str, amount: i64, description: &str) -> Result<i64> {
        if amount < 0 {
            return Err(anyhow!("negative credit {} for {}", amount, user_id));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO wallets (user_id, balance) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET balance = balance + excluded.balance",
                (user_id, amount),
            )?;
            tx.execute(
                "INSERT INTO wallet_ledger (user_id, amount, description) VALUES (?1, ?2, ?3)",
                (user_id, amount, description),
            )?;
            let balance = query_balance(&tx, user_id)?;
            tx.commit()?;
            Ok(balance)
        })
    }

    pub fn get_ledger(&self, user_id: &str) -> Result<Vec<LedgerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, description, created_at
                 FROM wallet_ledger WHERE user_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(LedgerRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        amount: row.get(2)?,
                        description: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: row.get(3)?,
        content: row.get(4)?,
        media_url: row.get(5)?,
        price: row.get(6)?,
        read_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn query_messages(
    conn: &Connection,
    chat_id: &str,
    after: Option<&str>,
    before: Option<&str>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    // Without a lower bound the newest rows are wanted, so that case scans
    // descending and is flipped afterwards.
    let descending = after.is_none();
    let order = if descending { "DESC" } else { "ASC" };

    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages
         WHERE chat_id = ?1
           AND (?2 IS NULL OR created_at > ?2)
           AND (?3 IS NULL OR created_at < ?3)
         ORDER BY created_at {order}, id {order}
         LIMIT ?4"
    ))?;

    let mut rows = stmt
        .query_map(rusqlite::params![chat_id, after, before, limit], map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if descending {
        rows.reverse();
    }
    Ok(rows)
}

/// Batch-fetch unlock sets for a set of message IDs.
fn query_unlocks(conn: &Connection, message_ids: &[String]) -> Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if message_ids.is_empty() {
        return Ok(map);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, user_id FROM message_unlocks WHERE message_id IN ({}) ORDER BY unlocked_at, user_id",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (message_id, user_id) in rows {
        map.entry(message_id).or_default().push(user_id);
    }
    Ok(map)
}

fn query_balance(conn: &Connection, user_id: &str) -> Result<i64> {
    let balance: Option<i64> = conn
        .query_row("SELECT balance FROM wallets WHERE user_id = ?1", [user_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(balance.unwrap_or(0))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
