use crate::Database;
use crate::models::{
    ConversationRow, MessageReadRow, MessageRow, PendingSendRow, ReactionRow, UserRow,
};
use anyhow::Result;
use rusqlite::Connection;

/// Inputs for the single-transaction message persist (gateway step 4).
pub struct PersistMessage<'a> {
    pub message_id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    /// The other participant — used for the status flip check.
    pub other_id: &'a str,
    pub text: &'a str,
    pub attachments_json: &'a str,
    pub preview: &'a str,
    pub created_at: &'a str,
    /// `Some(max)` when the sender's verdict is limited; `None` when
    /// unlimited. Limited sends consume one unit of the request allowance
    /// atomically with the message insert.
    pub limit: Option<u32>,
}

pub enum SendTxOutcome {
    Persisted(MessageRow),
    /// The guarded counter increment found the allowance already spent.
    /// Nothing was written.
    LimitExceeded,
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn set_message_privacy(&self, user_id: &str, privacy: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET message_privacy = ?2 WHERE id = ?1",
                (user_id, privacy),
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_message_privacy(&self, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT message_privacy FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    // -- Social graph --

    pub fn add_follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO follows (follower_id, following_id) VALUES (?1, ?2)",
                (follower_id, following_id),
            )?;
            Ok(())
        })
    }

    pub fn remove_follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM follows WHERE follower_id = ?1 AND following_id = ?2",
                (follower_id, following_id),
            )?;
            Ok(())
        })
    }

    pub fn follow_exists(&self, follower_id: &str, following_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = ?1 AND following_id = ?2)",
                (follower_id, following_id),
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    pub fn add_block(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id) VALUES (?1, ?2)",
                (blocker_id, blocked_id),
            )?;
            Ok(())
        })
    }

    pub fn remove_block(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
                (blocker_id, blocked_id),
            )?;
            Ok(())
        })
    }

    /// A block in either direction forbids messaging in both.
    pub fn block_exists_either(&self, a: &str, b: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(
                     SELECT 1 FROM blocks
                     WHERE (blocker_id = ?1 AND blocked_id = ?2)
                        OR (blocker_id = ?2 AND blocked_id = ?1)
                 )",
                (a, b),
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    // -- Conversations --

    /// Create-if-absent keyed by the deterministic pair id. Returns true if
    /// this call created the row. Requires participant_a < participant_b.
    pub fn create_conversation_if_absent(
        &self,
        id: &str,
        participant_a: &str,
        participant_b: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, participant_a, participant_b)
                 VALUES (?1, ?2, ?3)",
                (id, participant_a, participant_b),
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, participant_a, participant_b, status,
                        last_message_preview, last_message_at, last_message_sender_id
                 FROM conversations WHERE id = ?1",
                [id],
                row_to_conversation,
            )
            .optional()
        })
    }

    pub fn conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_a, participant_b, status,
                        last_message_preview, last_message_at, last_message_sender_id
                 FROM conversations
                 WHERE participant_a = ?1 OR participant_b = ?1
                 ORDER BY last_message_at IS NULL, last_message_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], row_to_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn mark_conversation_accepted(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET status = 'accepted' WHERE id = ?1 AND status = 'pending'",
                [id],
            )?;
            Ok(())
        })
    }

    // -- Transactional send --

    /// Persist a message and the conversation bookkeeping in one SQLite
    /// transaction. The request-count increment is a guarded upsert, never a
    /// read-modify-write; preview fields resolve last-writer-by-timestamp.
    pub fn persist_message(&self, args: &PersistMessage<'_>) -> Result<SendTxOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(max) = args.limit {
                let n = tx.execute(
                    "INSERT INTO request_counts (conversation_id, user_id, count)
                     VALUES (?1, ?2, 1)
                     ON CONFLICT(conversation_id, user_id)
                     DO UPDATE SET count = count + 1 WHERE count < ?3",
                    (args.conversation_id, args.sender_id, max),
                )?;
                if n == 0 {
                    // Allowance spent; the transaction drops without commit.
                    return Ok(SendTxOutcome::LimitExceeded);
                }
            }

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, text, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    args.message_id,
                    args.conversation_id,
                    args.sender_id,
                    args.text,
                    args.attachments_json,
                    args.created_at,
                ),
            )?;
            let seq = tx.last_insert_rowid();

            // Last-writer-by-timestamp on the aggregate fields: a concurrent
            // newer send must not be clobbered by this one.
            tx.execute(
                "UPDATE conversations
                 SET last_message_preview = ?2, last_message_at = ?3, last_message_sender_id = ?4
                 WHERE id = ?1 AND (last_message_at IS NULL OR last_message_at <= ?3)",
                (
                    args.conversation_id,
                    args.preview,
                    args.created_at,
                    args.sender_id,
                ),
            )?;

            // Pending -> accepted only on reciprocity: the other side has
            // sent before, or the follow relation is mutual. An open privacy
            // setting alone never accepts the conversation.
            let reciprocal: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages
                               WHERE conversation_id = ?1 AND sender_id = ?2)
                     OR (EXISTS(SELECT 1 FROM follows
                                WHERE follower_id = ?2 AND following_id = ?3)
                    AND EXISTS(SELECT 1 FROM follows
                               WHERE follower_id = ?3 AND following_id = ?2))",
                (args.conversation_id, args.other_id, args.sender_id),
                |row| row.get(0),
            )?;
            if reciprocal {
                tx.execute(
                    "UPDATE conversations SET status = 'accepted' WHERE id = ?1 AND status = 'pending'",
                    [args.conversation_id],
                )?;
            }

            tx.commit()?;

            Ok(SendTxOutcome::Persisted(MessageRow {
                seq,
                id: args.message_id.to_string(),
                conversation_id: args.conversation_id.to_string(),
                sender_id: args.sender_id.to_string(),
                text: args.text.to_string(),
                attachments: args.attachments_json.to_string(),
                created_at: args.created_at.to_string(),
                deleted_at: None,
            }))
        })
    }

    pub fn request_count(&self, conversation_id: &str, user_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count: Option<u32> = conn
                .query_row(
                    "SELECT count FROM request_counts WHERE conversation_id = ?1 AND user_id = ?2",
                    (conversation_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }

    // -- Messages --

    /// Newest page first; pass `before_seq` from the previous page to walk
    /// back through history.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before_seq: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, id, conversation_id, sender_id, text, attachments, created_at, deleted_at
                 FROM messages
                 WHERE conversation_id = ?1 AND (?3 IS NULL OR seq < ?3)
                 ORDER BY seq DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit, before_seq], row_to_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT seq, id, conversation_id, sender_id, text, attachments, created_at, deleted_at
                 FROM messages WHERE id = ?1",
                [id],
                row_to_message,
            )
            .optional()
        })
    }

    /// Soft delete, sender only. The row stays for ordering stability.
    pub fn soft_delete_message(&self, id: &str, sender_id: &str, deleted_at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET deleted_at = ?3
                 WHERE id = ?1 AND sender_id = ?2 AND deleted_at IS NULL",
                (id, sender_id, deleted_at),
            )?;
            Ok(n > 0)
        })
    }

    // -- Reactions --

    /// Append-only set semantics; returns false if the reaction was already
    /// present.
    pub fn add_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO reactions (id, message_id, user_id, emoji)
                 VALUES (?1, ?2, ?3, ?4)",
                (id, message_id, user_id, emoji),
            )?;
            Ok(n > 0)
        })
    }

    pub fn remove_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                (message_id, user_id, emoji),
            )?;
            Ok(n > 0)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Read receipts --

    /// Stamp every unread inbound message up to `through_seq` as read by
    /// `user_id`. Returns the number of rows stamped.
    pub fn mark_read_through(
        &self,
        conversation_id: &str,
        user_id: &str,
        through_seq: i64,
        read_at: &str,
    ) -> Result<u32> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 SELECT id, ?2, ?4 FROM messages
                 WHERE conversation_id = ?1 AND seq <= ?3 AND sender_id != ?2",
                (conversation_id, user_id, through_seq, read_at),
            )?;
            Ok(n as u32)
        })
    }

    /// Batch-fetch read receipts for a set of message IDs.
    pub fn get_reads_for_messages(&self, message_ids: &[String]) -> Result<Vec<MessageReadRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(MessageReadRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Pending sends (offline queue) --

    pub fn enqueue_send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        recipient_id: &str,
        text: &str,
        attachments_json: &str,
        enqueued_at: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_sends
                     (conversation_id, sender_id, recipient_id, text, attachments, enqueued_at, next_attempt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                (
                    conversation_id,
                    sender_id,
                    recipient_id,
                    text,
                    attachments_json,
                    enqueued_at,
                ),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Due queue heads: for each conversation, the oldest queued item, if its
    /// backoff deadline has passed. FIFO within a conversation is preserved
    /// because a not-yet-due head blocks everything behind it.
    pub fn due_sends(&self, now: &str, limit: u32) -> Result<Vec<PendingSendRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT local_id, conversation_id, sender_id, recipient_id, text, attachments,
                        state, attempts, enqueued_at, next_attempt_at
                 FROM pending_sends p
                 WHERE state = 'queued'
                   AND next_attempt_at <= ?1
                   AND local_id = (
                       SELECT MIN(local_id) FROM pending_sends q
                       WHERE q.conversation_id = p.conversation_id AND q.state = 'queued'
                   )
                 ORDER BY local_id
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map((now, limit), row_to_pending)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn bump_send_attempt(
        &self,
        local_id: i64,
        attempts: u32,
        next_attempt_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_sends SET attempts = ?2, next_attempt_at = ?3 WHERE local_id = ?1",
                (local_id, attempts, next_attempt_at),
            )?;
            Ok(())
        })
    }

    /// Park the item as permanently failed; it stays visible for explicit
    /// discard or resend.
    pub fn mark_send_failed(&self, local_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_sends SET state = 'failed' WHERE local_id = ?1",
                [local_id],
            )?;
            Ok(())
        })
    }

    pub fn delete_send(&self, local_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM pending_sends WHERE local_id = ?1", [local_id])?;
            Ok(())
        })
    }

    pub fn failed_sends_for(&self, sender_id: &str) -> Result<Vec<PendingSendRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT local_id, conversation_id, sender_id, recipient_id, text, attachments,
                        state, attempts, enqueued_at, next_attempt_at
                 FROM pending_sends
                 WHERE state = 'failed' AND sender_id = ?1
                 ORDER BY local_id",
            )?;
            let rows = stmt
                .query_map([sender_id], row_to_pending)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Manual resend of a parked item: back to the queue with a fresh
    /// attempt budget.
    pub fn requeue_send(&self, local_id: i64, next_attempt_at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE pending_sends SET state = 'queued', attempts = 0, next_attempt_at = ?2
                 WHERE local_id = ?1 AND state = 'failed'",
                (local_id, next_attempt_at),
            )?;
            Ok(n > 0)
        })
    }

    pub fn queued_send_count(&self) -> Result<u32> {
        self.with_conn(|conn| {
            let n: u32 = conn.query_row(
                "SELECT COUNT(*) FROM pending_sends WHERE state = 'queued'",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    // `column` is always a literal from this module, never user input.
    let sql = format!(
        "SELECT id, username, password, message_privacy, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                message_privacy: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        status: row.get(3)?,
        last_message_preview: row.get(4)?,
        last_message_at: row.get(5)?,
        last_message_sender_id: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        text: row.get(4)?,
        attachments: row.get(5)?,
        created_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingSendRow> {
    Ok(PendingSendRow {
        local_id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        recipient_id: row.get(3)?,
        text: row.get(4)?,
        attachments: row.get(5)?,
        state: row.get(6)?,
        attempts: row.get(7)?,
        enqueued_at: row.get(8)?,
        next_attempt_at: row.get(9)?,
    })
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
