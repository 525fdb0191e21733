use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::AttachmentRef;

/// Events fanned out over a conversation subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConversationEvent {
    /// A new message was persisted. Delivery is at-least-once; subscribers
    /// deduplicate by `id`.
    MessageCreate {
        id: Uuid,
        seq: i64,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: String,
        attachments: Vec<AttachmentRef>,
        created_at: chrono::DateTime<chrono::Utc>,
    },

    /// A user started typing. Ephemeral and lossy: treat as expired once
    /// `expires_at` passes even without a stop event.
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    /// Coarse online/offline flag with a last-seen fallback.
    PresenceUpdate {
        user_id: Uuid,
        online: bool,
        last_seen: chrono::DateTime<chrono::Utc>,
    },

    /// A reaction was added to a message.
    ReactionAdd {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// A reaction was removed from a message.
    ReactionRemove {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// Messages up to `through_seq` were read by `user_id`.
    MessageRead {
        conversation_id: Uuid,
        user_id: Uuid,
        through_seq: i64,
    },
}

impl ConversationEvent {
    /// The conversation this event is scoped to. Presence updates are
    /// global and fan out to every active topic.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreate { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. }
            | Self::ReactionAdd { conversation_id, .. }
            | Self::ReactionRemove { conversation_id, .. }
            | Self::MessageRead { conversation_id, .. } => Some(*conversation_id),
            Self::PresenceUpdate { .. } => None,
        }
    }

    /// Message id for dedup, when the event carries a persisted message.
    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreate { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Commands sent from client to server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection.
    Identify { token: String },

    /// Open subscriptions for the given conversations. Replaces the
    /// current subscription set.
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Indicate typing in a conversation.
    StartTyping { conversation_id: Uuid },
}
