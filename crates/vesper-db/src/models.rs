//! Database row types, mapping directly to SQLite rows. Kept distinct from
//! the vesper-types API models so the DB layer stays independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub message_privacy: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub status: String,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<String>,
    pub last_message_sender_id: Option<String>,
}

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub attachments: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct MessageReadRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}

pub struct PendingSendRow {
    pub local_id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub text: String,
    pub attachments: String,
    pub state: String,
    pub attempts: u32,
    pub enqueued_at: String,
    pub next_attempt_at: String,
}
