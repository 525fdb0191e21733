use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AttachmentRef, ConversationStatus, MessagePrivacy};

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Social graph --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPrivacyRequest {
    pub message_privacy: MessagePrivacy,
}

// -- Conversations --

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub participant_ids: [Uuid; 2],
    pub status: ConversationStatus,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_message_sender_id: Option<Uuid>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub seq: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deleted: bool,
    pub reactions: Vec<ReactionGroup>,
    /// Users who have marked this message read.
    pub read_by: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub through_seq: i64,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactionRequest {
    pub emoji: String,
}

/// One emoji's reactions on a message, grouped for display.
#[derive(Debug, Serialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

// -- Attachments --

#[derive(Debug, Serialize)]
pub struct AttachmentUploadResponse {
    pub attachment: AttachmentRef,
}
