use rusqlite::Connection;
use tracing::debug;

pub const SCHEMA_VERSION: u32 = 1;

pub fn run(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cached_messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            cached_at   TEXT NOT NULL,
            payload     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cached_messages_chat
            ON cached_messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS chat_sync_meta (
            chat_id         TEXT PRIMARY KEY,
            last_sync_at    TEXT,
            last_message_id TEXT,
            last_message_at TEXT,
            message_count   INTEGER NOT NULL DEFAULT 0,
            schema_version  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_flags (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        ",
    )?;

    debug!("Cache migrations complete");
    Ok(())
}
