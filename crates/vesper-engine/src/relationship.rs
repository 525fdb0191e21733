use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use vesper_db::Database;
use vesper_types::models::MessagePrivacy;

/// Read-only view over follow edges, block relations, and the recipient's
/// privacy setting. The engine never writes through this seam; the social
/// graph subsystem owns the edges.
pub trait RelationshipOracle: Send + Sync {
    /// Does `follower` follow `following`?
    fn follows(&self, follower: Uuid, following: Uuid) -> Result<bool>;

    /// Is there a block in either direction between `a` and `b`?
    fn blocked_either(&self, a: Uuid, b: Uuid) -> Result<bool>;

    /// The user's messaging privacy setting. Unknown users fall back to the
    /// default (`followers`), the most restrictive non-blocking verdict.
    fn message_privacy(&self, user_id: Uuid) -> Result<MessagePrivacy>;
}

/// SQLite-backed oracle over the follows/blocks/users tables.
pub struct DbRelationshipOracle {
    db: Arc<Database>,
}

impl DbRelationshipOracle {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl RelationshipOracle for DbRelationshipOracle {
    fn follows(&self, follower: Uuid, following: Uuid) -> Result<bool> {
        self.db
            .follow_exists(&follower.to_string(), &following.to_string())
    }

    fn blocked_either(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.db.block_exists_either(&a.to_string(), &b.to_string())
    }

    fn message_privacy(&self, user_id: Uuid) -> Result<MessagePrivacy> {
        let raw = self.db.get_message_privacy(&user_id.to_string())?;
        Ok(raw
            .as_deref()
            .and_then(MessagePrivacy::parse)
            .unwrap_or_default())
    }
}
