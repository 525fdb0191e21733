use std::time::Duration;

/// Reasons a message payload is rejected before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message has no text and no attachments")]
    EmptyPayload,
    #[error("text exceeds {max} code points (got {got})")]
    TextTooLong { max: usize, got: usize },
    #[error("too many attachments: {got} (max {max})")]
    TooManyAttachments { max: usize, got: usize },
    #[error("attachment {index} is {got} bytes (max {max})")]
    AttachmentTooLarge { index: usize, max: u64, got: u64 },
    #[error("text contains disallowed control characters")]
    DisallowedControlChars,
}

/// The full failure taxonomy for a send. Only `Storage` is eligible for
/// offline staging and retry; everything else is terminal or carries its own
/// retry hint.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Blocked pair. Deliberately carries no detail so the caller cannot
    /// distinguish a block from any other denial.
    #[error("message could not be sent")]
    PermissionDenied,

    /// The single message request was already used; the recipient must
    /// follow back before the sender may send again.
    #[error("message request already sent; awaiting reciprocity")]
    RequestLimitExceeded,

    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("unknown conversation {0}")]
    UnknownConversation(uuid::Uuid),

    #[error("sender is not a participant in conversation {0}")]
    NotParticipant(uuid::Uuid),

    /// Transient storage or transport failure — the only class the
    /// OfflineQueue stages and retries.
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl SendError {
    /// Terminal errors must never be retried automatically; queuing a send
    /// destined to fail the same check again is a correctness bug.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::RateLimited { .. })
    }

    /// Whether the offline queue may stage this failure for a later drain.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
