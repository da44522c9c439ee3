use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            public_key  TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL DEFAULT 'public',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Membership rows are written once, inside the same transaction that
        -- creates the chat, and never updated afterwards.
        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            UNIQUE(chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_members_user
            ON chat_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            author_id   TEXT NOT NULL REFERENCES users(id),
            body        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        -- Append-only link table; a message belongs to exactly one chat.
        CREATE TABLE IF NOT EXISTS chat_messages (
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            message_id  TEXT NOT NULL UNIQUE REFERENCES messages(id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_chat
            ON chat_messages(chat_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
