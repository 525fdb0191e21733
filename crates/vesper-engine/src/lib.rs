//! Vesper messaging engine: the permission and delivery core.
//!
//! Decides whether a sender may message a recipient, enforces the
//! one-message request limit until reciprocity, creates conversations
//! idempotently, persists messages with per-conversation ordering, and
//! stages sends made while offline. Fan-out to live subscribers goes
//! through vesper-bus; push notifications leave through the
//! `NotificationTrigger` boundary.

pub mod attachments;
pub mod directory;
pub mod gateway;
pub mod notify;
pub mod offline;
pub mod permission;
pub mod ratelimit;
pub mod relationship;
pub mod validate;

pub use attachments::{AttachmentStore, FsAttachmentStore};
pub use directory::ConversationDirectory;
pub use gateway::MessageGateway;
pub use notify::{LogNotifier, NotificationEvent, NotificationTrigger};
pub use offline::{MessageSink, OfflineQueue, SendAttempt};
pub use permission::PermissionEvaluator;
pub use ratelimit::RateLimiter;
pub use relationship::{DbRelationshipOracle, RelationshipOracle};
