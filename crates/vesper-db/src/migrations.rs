use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id               TEXT PRIMARY KEY,
            username         TEXT NOT NULL UNIQUE,
            password         TEXT NOT NULL,
            message_privacy  TEXT NOT NULL DEFAULT 'followers',
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS follows (
            follower_id   TEXT NOT NULL REFERENCES users(id),
            following_id  TEXT NOT NULL REFERENCES users(id),
            created_at    TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (follower_id, following_id)
        );

        CREATE TABLE IF NOT EXISTS blocks (
            blocker_id  TEXT NOT NULL REFERENCES users(id),
            blocked_id  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (blocker_id, blocked_id)
        );

        -- participant_a < participant_b; the id is derived from the pair,
        -- so INSERT OR IGNORE makes creation idempotent.
        CREATE TABLE IF NOT EXISTS conversations (
            id                      TEXT PRIMARY KEY,
            participant_a           TEXT NOT NULL REFERENCES users(id),
            participant_b           TEXT NOT NULL REFERENCES users(id),
            status                  TEXT NOT NULL DEFAULT 'pending',
            last_message_preview    TEXT,
            last_message_at         TEXT,
            last_message_sender_id  TEXT,
            created_at              TEXT NOT NULL DEFAULT (datetime('now')),
            CHECK (participant_a < participant_b)
        );

        -- Entries exist only for senders who sent under a limited verdict.
        CREATE TABLE IF NOT EXISTS request_counts (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            count            INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conversation_id, user_id)
        );

        -- seq is the server-assigned monotonic order.
        CREATE TABLE IF NOT EXISTS messages (
            seq              INTEGER PRIMARY KEY AUTOINCREMENT,
            id               TEXT NOT NULL UNIQUE,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            sender_id        TEXT NOT NULL REFERENCES users(id),
            text             TEXT NOT NULL,
            attachments      TEXT NOT NULL DEFAULT '[]',
            created_at       TEXT NOT NULL,
            deleted_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        -- Offline staging area. Survives process restarts; drained FIFO
        -- per conversation.
        CREATE TABLE IF NOT EXISTS pending_sends (
            local_id         INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id  TEXT NOT NULL,
            sender_id        TEXT NOT NULL,
            recipient_id     TEXT NOT NULL,
            text             TEXT NOT NULL,
            attachments      TEXT NOT NULL DEFAULT '[]',
            state            TEXT NOT NULL DEFAULT 'queued',
            attempts         INTEGER NOT NULL DEFAULT 0,
            enqueued_at      TEXT NOT NULL,
            next_attempt_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pending_sends_due
            ON pending_sends(state, next_attempt_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
