use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use vesper_db::encode_ts;
use vesper_engine::directory::conversation_from_row;
use vesper_engine::gateway::message_from_row;
use vesper_types::api::{
    Claims, ConversationResponse, MarkReadRequest, MessageResponse, ReactionGroup,
};
use vesper_types::error::SendError;
use vesper_types::events::ConversationEvent;
use vesper_types::models::Conversation;

use crate::auth::{AppState, join_error};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `seq` of the oldest message from
    /// the previous page to fetch older ones.
    pub before_seq: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

/// Open (or return) the conversation between the caller and `user_id`.
/// Idempotent: both sides racing to first contact land on the same row.
pub async fn open(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let id = user_id.to_string();
    let exists = tokio::task::spawn_blocking(move || db.get_user_by_id(&id))
        .await
        .map_err(|e| SendError::Storage(format!("join error: {e}")))?
        .map_err(|e| SendError::Storage(e.to_string()))?
        .is_some();
    if !exists {
        return Err(SendError::UnknownConversation(
            vesper_engine::ConversationDirectory::conversation_id_for(claims.sub, user_id),
        )
        .into());
    }

    let conversation = state.directory.resolve(claims.sub, user_id).await?;
    Ok(Json(conversation_response(conversation)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.conversations_for_user(&user_id))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let conversations: Vec<ConversationResponse> = rows
        .iter()
        .filter_map(|row| conversation_from_row(row).ok())
        .map(conversation_response)
        .collect();
    Ok(Json(conversations))
}

pub async fn history(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let limit = query.limit.min(200);
    let before_seq = query.before_seq;

    let (rows, reaction_rows, read_rows) = tokio::task::spawn_blocking(move || {
        let rows = db.get_messages(&cid, limit, before_seq)?;
        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let reaction_rows = db.get_reactions_for_messages(&message_ids)?;
        let read_rows = db.get_reads_for_messages(&message_ids)?;
        anyhow::Ok((rows, reaction_rows, read_rows))
    })
    .await
    .map_err(|e| SendError::Storage(format!("join error: {e}")))?
    .map_err(|e| SendError::Storage(e.to_string()))?;

    // Group reactions by message id, then by emoji.
    let mut reaction_map: HashMap<String, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for r in &reaction_rows {
        if let Ok(uid) = r.user_id.parse::<Uuid>() {
            reaction_map
                .entry(r.message_id.clone())
                .or_default()
                .entry(r.emoji.clone())
                .or_default()
                .push(uid);
        }
    }

    let mut read_map: HashMap<String, Vec<Uuid>> = HashMap::new();
    for r in &read_rows {
        if let Ok(uid) = r.user_id.parse::<Uuid>() {
            read_map.entry(r.message_id.clone()).or_default().push(uid);
        }
    }

    let messages: Vec<MessageResponse> = rows
        .iter()
        .filter_map(|row| {
            let message = message_from_row(row).ok()?;
            let reactions = reaction_map
                .get(&row.id)
                .map(|emoji_map| {
                    emoji_map
                        .iter()
                        .map(|(emoji, user_ids)| ReactionGroup {
                            emoji: emoji.clone(),
                            count: user_ids.len(),
                            user_ids: user_ids.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let read_by = read_map.remove(&row.id).unwrap_or_default();
            Some(message_response(message, reactions, read_by))
        })
        .collect();

    Ok(Json(messages))
}

/// Mark every message up to `through_seq` as read by the caller and fan the
/// receipt out to live subscribers.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let user_id = claims.sub.to_string();
    let read_at = encode_ts(chrono::Utc::now());
    let marked = tokio::task::spawn_blocking(move || {
        db.mark_read_through(&cid, &user_id, req.through_seq, &read_at)
    })
    .await
    .map_err(|e| SendError::Storage(format!("join error: {e}")))?
    .map_err(|e| SendError::Storage(e.to_string()))?;

    if marked > 0 {
        state.bus.publish(ConversationEvent::MessageRead {
            conversation_id,
            user_id: claims.sub,
            through_seq: req.through_seq,
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

/// 404 for a missing conversation, 403 for an outsider. Shared by every
/// conversation-scoped handler.
pub(crate) async fn require_participant(
    state: &AppState,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Conversation, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let row = tokio::task::spawn_blocking(move || db.get_conversation(&cid))
        .await
        .map_err(|e| SendError::Storage(format!("join error: {e}")))?
        .map_err(|e| SendError::Storage(e.to_string()))?
        .ok_or(SendError::UnknownConversation(conversation_id))?;

    let conversation =
        conversation_from_row(&row).map_err(|e| SendError::Storage(e.to_string()))?;
    if conversation.other_participant(user_id).is_none() {
        return Err(SendError::NotParticipant(conversation_id).into());
    }
    Ok(conversation)
}

fn conversation_response(conversation: Conversation) -> ConversationResponse {
    ConversationResponse {
        id: conversation.id,
        participant_ids: [conversation.participant_a, conversation.participant_b],
        status: conversation.status,
        last_message_preview: conversation.last_message_preview,
        last_message_at: conversation.last_message_at,
        last_message_sender_id: conversation.last_message_sender_id,
    }
}

pub(crate) fn message_response(
    message: vesper_types::models::Message,
    reactions: Vec<ReactionGroup>,
    read_by: Vec<Uuid>,
) -> MessageResponse {
    // Soft-deleted messages keep their slot in the timeline but shed their
    // content.
    let (text, attachments) = if message.deleted {
        (String::new(), vec![])
    } else {
        (message.text, message.attachments)
    };
    MessageResponse {
        id: message.id,
        seq: message.seq,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        text,
        attachments,
        created_at: message.created_at,
        deleted: message.deleted,
        reactions,
        read_by,
    }
}
