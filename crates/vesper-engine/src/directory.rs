use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::relationship::RelationshipOracle;
use vesper_db::{Database, models::ConversationRow};
use vesper_types::error::SendError;
use vesper_types::models::{Conversation, ConversationStatus};

/// Maps an unordered user pair to exactly one conversation record.
///
/// The conversation id is a pure function of the sorted pair, so creation is
/// a create-if-absent write: two clients racing to message each other for
/// the first time converge on the same row without a lock.
pub struct ConversationDirectory {
    db: Arc<Database>,
    oracle: Arc<dyn RelationshipOracle>,
}

impl ConversationDirectory {
    pub fn new(db: Arc<Database>, oracle: Arc<dyn RelationshipOracle>) -> Self {
        Self { db, oracle }
    }

    /// Deterministic conversation id for a pair: first 16 bytes of
    /// SHA-256 over the canonically ordered ids. Stable across devices, so
    /// concurrent first contact is naturally idempotent.
    pub fn conversation_id_for(a: Uuid, b: Uuid) -> Uuid {
        let (lo, hi) = sort_pair(a, b);
        let mut hasher = Sha256::new();
        hasher.update(lo.as_bytes());
        hasher.update(b":");
        hasher.update(hi.as_bytes());
        let digest = hasher.finalize();
        // Truncation to 16 bytes is fine here: the id only needs to be
        // deterministic and unique per pair, not a valid RFC 4122 UUID.
        Uuid::from_slice(&digest[..16]).expect("16-byte slice")
    }

    /// Return the conversation for the pair, creating it if absent.
    pub async fn resolve(&self, a: Uuid, b: Uuid) -> Result<Conversation, SendError> {
        if a == b {
            return Err(SendError::PermissionDenied);
        }

        let db = self.db.clone();
        let oracle = self.oracle.clone();
        tokio::task::spawn_blocking(move || resolve_blocking(&db, oracle.as_ref(), a, b))
            .await
            .map_err(|e| SendError::Storage(format!("join error: {e}")))?
            .map_err(|e| SendError::Storage(e.to_string()))
    }
}

fn resolve_blocking(
    db: &Database,
    oracle: &dyn RelationshipOracle,
    a: Uuid,
    b: Uuid,
) -> Result<Conversation> {
    let (lo, hi) = sort_pair(a, b);
    let id = ConversationDirectory::conversation_id_for(lo, hi);

    let created =
        db.create_conversation_if_absent(&id.to_string(), &lo.to_string(), &hi.to_string())?;
    if created {
        tracing::debug!("created conversation {} for pair ({}, {})", id, lo, hi);
    }

    // A mutual pair starts (or becomes) accepted; no message required.
    if oracle.follows(lo, hi)? && oracle.follows(hi, lo)? {
        db.mark_conversation_accepted(&id.to_string())?;
    }

    let row = db
        .get_conversation(&id.to_string())?
        .ok_or_else(|| anyhow!("conversation {} vanished after create", id))?;
    conversation_from_row(&row)
}

pub fn conversation_from_row(row: &ConversationRow) -> Result<Conversation> {
    let last_message_at = row
        .last_message_at
        .as_deref()
        .map(vesper_db::decode_ts)
        .transpose()
        .context("bad last_message_at")?;

    Ok(Conversation {
        id: row.id.parse().context("bad conversation id")?,
        participant_a: row.participant_a.parse().context("bad participant_a")?,
        participant_b: row.participant_b.parse().context("bad participant_b")?,
        status: ConversationStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("bad status '{}'", row.status))?,
        last_message_preview: row.last_message_preview.clone(),
        last_message_at,
        last_message_sender_id: row
            .last_message_sender_id
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("bad last_message_sender_id")?,
    })
}

fn sort_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a.to_string() <= b.to_string() {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::DbRelationshipOracle;

    fn setup() -> (tempfile::TempDir, Arc<Database>, ConversationDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let oracle = Arc::new(DbRelationshipOracle::new(db.clone()));
        let directory = ConversationDirectory::new(db.clone(), oracle);
        (dir, db, directory)
    }

    fn seed_users(db: &Database) -> (Uuid, Uuid) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.create_user(&a.to_string(), "alice", "hash").unwrap();
        db.create_user(&b.to_string(), "bob", "hash").unwrap();
        (a, b)
    }

    #[test]
    fn id_is_deterministic_and_order_insensitive() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let id1 = ConversationDirectory::conversation_id_for(a, b);
        let id2 = ConversationDirectory::conversation_id_for(b, a);
        assert_eq!(id1, id2);
        assert_ne!(id1, ConversationDirectory::conversation_id_for(a, Uuid::new_v4()));
    }

    #[tokio::test]
    async fn resolve_creates_once_and_reuses() {
        let (_dir, db, directory) = setup();
        let (a, b) = seed_users(&db);

        let first = directory.resolve(a, b).await.unwrap();
        let second = directory.resolve(b, a).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ConversationStatus::Pending);

        let rows = db.conversations_for_user(&a.to_string()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolve_converges_on_one_row() {
        let (_dir, db, directory) = setup();
        let (a, b) = seed_users(&db);
        let directory = Arc::new(directory);

        let d1 = directory.clone();
        let d2 = directory.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { d1.resolve(a, b).await }),
            tokio::spawn(async move { d2.resolve(b, a).await }),
        );
        let c1 = r1.unwrap().unwrap();
        let c2 = r2.unwrap().unwrap();

        assert_eq!(c1.id, c2.id);
        assert_eq!(db.conversations_for_user(&a.to_string()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mutual_pair_resolves_accepted() {
        let (_dir, db, directory) = setup();
        let (a, b) = seed_users(&db);
        db.add_follow(&a.to_string(), &b.to_string()).unwrap();
        db.add_follow(&b.to_string(), &a.to_string()).unwrap();

        let convo = directory.resolve(a, b).await.unwrap();
        assert_eq!(convo.status, ConversationStatus::Accepted);
    }

    #[tokio::test]
    async fn self_pair_is_rejected() {
        let (_dir, db, directory) = setup();
        let (a, _) = seed_users(&db);
        assert!(matches!(
            directory.resolve(a, a).await,
            Err(SendError::PermissionDenied)
        ));
    }
}
