use chrono::{DateTime, Utc};
use rusqlite::params;
use thiserror::Error;
use uuid::Uuid;

use crate::Database;

/// Where an inbound message should land: an existing chat, or a receiver
/// username to resolve into a freshly created chat.
#[derive(Debug, Clone)]
pub enum MessageTarget {
    Conversation(Uuid),
    Receiver(String),
}

/// What the append transaction hands back so the session can stamp the
/// outbound frame.
#[derive(Debug, Clone, Copy)]
pub struct AppendReceipt {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Single failure surface for the append transaction. Callers treat every
/// variant the same way (log and drop the message); the variants only make
/// the operator log legible.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("receiver not found: {0}")]
    ReceiverNotFound(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("DB lock poisoned")]
    Poisoned,
}

impl Database {
    /// Durably record one inbound message. Runs as a single transaction:
    ///
    /// 1. insert the message row;
    /// 2. if no chat id was supplied, create the chat and both membership
    ///    rows (resolving the receiver username; an unknown receiver aborts
    ///    everything);
    /// 3. link the message to the chat.
    ///
    /// Any failure rolls the whole transaction back: no message, chat, or
    /// membership row survives. A supplied chat id that doesn't exist fails
    /// the link insert via the foreign key and rolls back the same way.
    pub fn append_message(
        &self,
        author_id: &str,
        body: &str,
        target: MessageTarget,
    ) -> Result<AppendReceipt, PersistError> {
        let mut conn = self.conn.lock().map_err(|_| PersistError::Poisoned)?;
        let tx = conn.transaction()?;

        let message_id = Uuid::new_v4();
        let created_at = Utc::now();

        tx.execute(
            "INSERT INTO messages (id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                message_id.to_string(),
                author_id,
                body,
                created_at.to_rfc3339()
            ],
        )?;

        let conversation_id = match target {
            MessageTarget::Conversation(id) => id,
            MessageTarget::Receiver(username) => {
                let receiver_id: String = match tx.query_row(
                    "SELECT id FROM users WHERE username = ?1",
                    [username.as_str()],
                    |row| row.get(0),
                ) {
                    Ok(id) => id,
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        return Err(PersistError::ReceiverNotFound(username));
                    }
                    Err(e) => return Err(e.into()),
                };

                let chat_id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO chats (id, kind) VALUES (?1, 'public')",
                    [chat_id.to_string()],
                )?;
                // UNIQUE(chat_id, user_id) rejects a self-addressed message
                // here, keeping every chat at two distinct members.
                tx.execute(
                    "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                    params![chat_id.to_string(), author_id],
                )?;
                tx.execute(
                    "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                    params![chat_id.to_string(), receiver_id],
                )?;
                chat_id
            }
        };

        tx.execute(
            "INSERT INTO chat_messages (chat_id, message_id) VALUES (?1, ?2)",
            params![conversation_id.to_string(), message_id.to_string()],
        )?;

        tx.commit()?;

        Ok(AppendReceipt {
            conversation_id,
            message_id,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_db() -> Database {
        Database::open(Path::new(":memory:")).unwrap()
    }

    fn seed_user(db: &Database, id: &str, username: &str) {
        db.create_user(id, username, "hash", None).unwrap();
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
        })
        .unwrap()
    }

    #[test]
    fn first_contact_creates_one_chat_with_both_members() {
        let db = test_db();
        seed_user(&db, "u-alice", "alice");
        seed_user(&db, "u-bob", "bob");

        let receipt = db
            .append_message("u-alice", "hi", MessageTarget::Receiver("bob".into()))
            .unwrap();

        assert_eq!(count(&db, "chats"), 1);
        assert_eq!(count(&db, "messages"), 1);
        assert_eq!(count(&db, "chat_messages"), 1);

        let members: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY user_id",
                )?;
                let rows = stmt
                    .query_map([receipt.conversation_id.to_string()], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(members, vec!["u-alice".to_string(), "u-bob".to_string()]);
    }

    #[test]
    fn second_message_with_chat_id_does_not_create_another_chat() {
        let db = test_db();
        seed_user(&db, "u-alice", "alice");
        seed_user(&db, "u-bob", "bob");

        let first = db
            .append_message("u-alice", "hi", MessageTarget::Receiver("bob".into()))
            .unwrap();
        let second = db
            .append_message(
                "u-bob",
                "hello back",
                MessageTarget::Conversation(first.conversation_id),
            )
            .unwrap();

        assert_eq!(second.conversation_id, first.conversation_id);
        assert_eq!(count(&db, "chats"), 1);
        assert_eq!(count(&db, "messages"), 2);
        assert_eq!(count(&db, "chat_members"), 2);
    }

    #[test]
    fn unknown_receiver_rolls_back_everything() {
        let db = test_db();
        seed_user(&db, "u-alice", "alice");

        let err = db
            .append_message("u-alice", "hi", MessageTarget::Receiver("ghost".into()))
            .unwrap_err();
        assert!(matches!(err, PersistError::ReceiverNotFound(ref name) if name == "ghost"));

        assert_eq!(count(&db, "messages"), 0);
        assert_eq!(count(&db, "chats"), 0);
        assert_eq!(count(&db, "chat_members"), 0);
        assert_eq!(count(&db, "chat_messages"), 0);
    }

    #[test]
    fn unknown_chat_id_rolls_back_the_message_row() {
        let db = test_db();
        seed_user(&db, "u-alice", "alice");

        let err = db
            .append_message(
                "u-alice",
                "hi",
                MessageTarget::Conversation(Uuid::new_v4()),
            )
            .unwrap_err();
        assert!(matches!(err, PersistError::Db(_)));

        assert_eq!(count(&db, "messages"), 0);
        assert_eq!(count(&db, "chat_messages"), 0);
    }

    #[test]
    fn self_addressed_first_contact_is_rejected() {
        let db = test_db();
        seed_user(&db, "u-alice", "alice");

        let err = db
            .append_message("u-alice", "note to self", MessageTarget::Receiver("alice".into()))
            .unwrap_err();
        assert!(matches!(err, PersistError::Db(_)));

        assert_eq!(count(&db, "chats"), 0);
        assert_eq!(count(&db, "messages"), 0);
    }
}
