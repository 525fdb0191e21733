use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who may open a conversation with this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePrivacy {
    /// Anyone may send without limit.
    Anyone,
    /// Non-mutual contacts get a single message request.
    Followers,
}

impl Default for MessagePrivacy {
    fn default() -> Self {
        Self::Followers
    }
}

impl MessagePrivacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anyone => "anyone",
            Self::Followers => "followers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anyone" => Some(Self::Anyone),
            "followers" => Some(Self::Followers),
            _ => None,
        }
    }
}

/// Messaging verdict for a (sender, recipient) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A block exists in either direction (or sender == recipient).
    Blocked,
    /// Mutual follow or recipient privacy is `anyone`.
    Unlimited,
    /// One message request allowed until the recipient follows back.
    Limited { max: u32 },
}

/// Lifecycle of a conversation, informational only — the gateway never
/// authorizes based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Accepted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// A 1:1 conversation. `participant_a` < `participant_b` (canonical order);
/// the pair never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_a: Uuid,
    pub participant_b: Uuid,
    pub status: ConversationStatus,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_message_sender_id: Option<Uuid>,
}

impl Conversation {
    /// The participant that is not `user_id`, if `user_id` is a participant.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.participant_a {
            Some(self.participant_b)
        } else if user_id == self.participant_b {
            Some(self.participant_a)
        } else {
            None
        }
    }
}

/// Stable reference to an uploaded attachment blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: Uuid,
    pub url: String,
    pub byte_len: u64,
    pub mime: String,
}

/// A persisted message. `seq` is the server-assigned monotonic order within
/// the store; clients sort by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub seq: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deleted: bool,
}

/// State machine for an outgoing message staged locally. Reconciliation of
/// the optimistic entry with the server-assigned id is the `Sent` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundState {
    /// Staged in the offline queue, awaiting a drain attempt.
    Queued,
    /// Durably persisted; carries the server-assigned message id.
    Sent { server_id: Uuid },
    /// Terminally rejected or retries exhausted; requires explicit
    /// discard or resend.
    Failed { reason: String },
}
