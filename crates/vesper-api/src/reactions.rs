use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use vesper_types::api::{Claims, ReactionRequest};
use vesper_types::error::SendError;
use vesper_types::events::ConversationEvent;

use crate::auth::AppState;
use crate::conversations::require_participant;
use crate::error::ApiError;

/// One reaction per (message, user, emoji); re-adding is a no-op.
pub async fn add_reaction(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, claims.sub).await?;
    require_message(&state, conversation_id, message_id).await?;

    let db = state.db.clone();
    let reaction_id = Uuid::new_v4().to_string();
    let mid = message_id.to_string();
    let uid = claims.sub.to_string();
    let emoji = req.emoji.clone();
    let added = tokio::task::spawn_blocking(move || {
        db.add_reaction(&reaction_id, &mid, &uid, &emoji)
    })
    .await
    .map_err(|e| SendError::Storage(format!("join error: {e}")))?
    .map_err(|e| SendError::Storage(e.to_string()))?;

    if added {
        state.bus.publish(ConversationEvent::ReactionAdd {
            conversation_id,
            message_id,
            user_id: claims.sub,
            emoji: req.emoji,
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let mid = message_id.to_string();
    let uid = claims.sub.to_string();
    let emoji = req.emoji.clone();
    let removed =
        tokio::task::spawn_blocking(move || db.remove_reaction(&mid, &uid, &emoji))
            .await
            .map_err(|e| SendError::Storage(format!("join error: {e}")))?
            .map_err(|e| SendError::Storage(e.to_string()))?;

    if removed {
        state.bus.publish(ConversationEvent::ReactionRemove {
            conversation_id,
            message_id,
            user_id: claims.sub,
            emoji: req.emoji,
        });
    }
    Ok(StatusCode::NO_CONTENT)
}

/// The message must exist and belong to the conversation in the path.
async fn require_message(
    state: &AppState,
    conversation_id: Uuid,
    message_id: Uuid,
) -> Result<(), ApiError> {
    let db = state.db.clone();
    let mid = message_id.to_string();
    let row = tokio::task::spawn_blocking(move || db.get_message(&mid))
        .await
        .map_err(|e| SendError::Storage(format!("join error: {e}")))?
        .map_err(|e| SendError::Storage(e.to_string()))?
        .ok_or(SendError::UnknownConversation(conversation_id))?;

    if row.conversation_id != conversation_id.to_string() || row.deleted_at.is_some() {
        return Err(SendError::UnknownConversation(conversation_id).into());
    }
    Ok(())
}
