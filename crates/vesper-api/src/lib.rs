//! REST surface over the messaging engine: auth, the social graph,
//! conversations, messages, reactions, and attachment intake.

pub mod attachments;
pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod social;
