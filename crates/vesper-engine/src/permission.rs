use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use crate::relationship::RelationshipOracle;
use vesper_types::models::{MessagePrivacy, Verdict};

/// One message allowed toward a non-mutual, `followers`-privacy recipient
/// until they follow back.
pub const REQUEST_LIMIT: u32 = 1;

/// Combines relationship state and the recipient's privacy setting into a
/// messaging verdict. Pure view over the oracle: nothing is cached across
/// sends, so a follow-back takes effect on the very next evaluation.
pub struct PermissionEvaluator {
    oracle: Arc<dyn RelationshipOracle>,
}

impl PermissionEvaluator {
    pub fn new(oracle: Arc<dyn RelationshipOracle>) -> Self {
        Self { oracle }
    }

    pub fn evaluate(&self, sender_id: Uuid, recipient_id: Uuid) -> Result<Verdict> {
        // Blocks dominate everything, in either direction.
        if self.oracle.blocked_either(sender_id, recipient_id)? {
            return Ok(Verdict::Blocked);
        }

        if sender_id == recipient_id {
            return Ok(Verdict::Blocked);
        }

        if self.oracle.message_privacy(recipient_id)? == MessagePrivacy::Anyone {
            return Ok(Verdict::Unlimited);
        }

        let mutual = self.oracle.follows(sender_id, recipient_id)?
            && self.oracle.follows(recipient_id, sender_id)?;
        if mutual {
            return Ok(Verdict::Unlimited);
        }

        Ok(Verdict::Limited { max: REQUEST_LIMIT })
    }
}
