use crate::Database;
use crate::models::{ChatRow, MemberRow, MessageRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        public_key: Option<&str>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, public_key) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, username, password_hash, public_key],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    // -- Chats --

    /// Chats the user belongs to, most recent activity first. Each row carries
    /// the latest message so clients can render the list without a second
    /// round trip.
    pub fn get_chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, m.body, MAX(m.created_at) AS last_time
                 FROM chats c
                 JOIN chat_messages cm ON cm.chat_id = c.id
                 JOIN messages m ON m.id = cm.message_id
                 WHERE c.id IN (SELECT chat_id FROM chat_members WHERE user_id = ?1)
                 GROUP BY c.id
                 ORDER BY last_time DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        last_message: row.get(1)?,
                        last_message_time: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_members(&self, chat_id: &str) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.username, u.public_key
                 FROM users u
                 JOIN chat_members cm ON cm.user_id = u.id
                 WHERE cm.chat_id = ?1
                 ORDER BY u.username",
            )?;

            let rows = stmt
                .query_map([chat_id], |row| {
                    Ok(MemberRow {
                        username: row.get(0)?,
                        public_key: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    /// Paginated history for one chat, newest first. JOINs users to fetch the
    /// author username in a single query.
    pub fn get_messages(&self, chat_id: &str, limit: u32, offset: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.body, u.username, m.created_at
                 FROM messages m
                 JOIN chat_messages cm ON cm.message_id = m.id
                 LEFT JOIN users u ON u.id = m.author_id
                 WHERE cm.chat_id = ?1
                 ORDER BY m.created_at DESC
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![chat_id, limit, offset], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        body: row.get(1)?,
                        author_username: row
                            .get::<_, Option<String>>(2)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password, public_key, created_at FROM users WHERE username = ?1",
    )?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                public_key: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
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
