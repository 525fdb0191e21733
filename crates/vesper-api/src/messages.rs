use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use vesper_db::encode_ts;
use vesper_types::api::{Claims, SendMessageRequest};
use vesper_types::error::SendError;

use crate::auth::AppState;
use crate::conversations::{message_response, require_participant};
use crate::error::ApiError;

/// Send through the gateway: validation, permission evaluation, the request
/// limit, and rate limiting all apply here, not in the handler.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .gateway
        .send(conversation_id, claims.sub, req.text, req.attachments)
        .await?;

    Ok((StatusCode::CREATED, Json(message_response(message, vec![], vec![]))))
}

/// Soft delete: only the sender may delete, and the message keeps its seq
/// slot so pagination cursors stay valid.
pub async fn delete_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, conversation_id, claims.sub).await?;

    let db = state.db.clone();
    let mid = message_id.to_string();
    let sender = claims.sub.to_string();
    let deleted_at = encode_ts(chrono::Utc::now());
    let deleted =
        tokio::task::spawn_blocking(move || db.soft_delete_message(&mid, &sender, &deleted_at))
            .await
            .map_err(|e| SendError::Storage(format!("join error: {e}")))?
            .map_err(|e| SendError::Storage(e.to_string()))?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        // Either not the sender's message or already deleted; don't reveal
        // which.
        Err(SendError::NotParticipant(conversation_id).into())
    }
}
