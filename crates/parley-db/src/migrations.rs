use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chat_participants (
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            user_id     TEXT NOT NULL,
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            sender_id   TEXT NOT NULL,
            kind        TEXT NOT NULL,
            content     TEXT,
            media_url   TEXT,
            price       INTEGER,
            read_at     TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS message_unlocks (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            unlocked_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS wallets (
            user_id     TEXT PRIMARY KEY,
            balance     INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
        );

        CREATE TABLE IF NOT EXISTS wallet_ledger (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            amount      INTEGER NOT NULL,
            description TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_user
            ON wallet_ledger(user_id, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
