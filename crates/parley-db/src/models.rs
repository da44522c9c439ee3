/// Database row types; these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub public_key: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub body: String,
    pub author_username: String,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub last_message: String,
    pub last_message_time: String,
}

pub struct MemberRow {
    pub username: String,
    pub public_key: Option<String>,
}
