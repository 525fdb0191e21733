use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use vesper_types::api::{Claims, SetPrivacyRequest};

use crate::auth::{AppState, join_error};

pub async fn follow(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    if user_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_user_exists(&state, user_id).await?;

    let db = state.db.clone();
    let follower = claims.sub.to_string();
    let following = user_id.to_string();
    tokio::task::spawn_blocking(move || db.add_follow(&follower, &following))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("{} followed {}", claims.sub, user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unfollow(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let follower = claims.sub.to_string();
    let following = user_id.to_string();
    tokio::task::spawn_blocking(move || db.remove_follow(&follower, &following))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn block(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    if user_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }
    ensure_user_exists(&state, user_id).await?;

    let db = state.db.clone();
    let blocker = claims.sub.to_string();
    let blocked = user_id.to_string();
    tokio::task::spawn_blocking(move || db.add_block(&blocker, &blocked))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("{} blocked {}", claims.sub, user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unblock(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let blocker = claims.sub.to_string();
    let blocked = user_id.to_string();
    tokio::task::spawn_blocking(move || db.remove_block(&blocker, &blocked))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Who may start a conversation with me. Takes effect on the next
/// permission evaluation, no re-login needed.
pub async fn set_privacy(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetPrivacyRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let privacy = req.message_privacy.as_str().to_string();
    let updated = tokio::task::spawn_blocking(move || db.set_message_privacy(&user_id, &privacy))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn ensure_user_exists(state: &AppState, user_id: Uuid) -> Result<(), StatusCode> {
    let db = state.db.clone();
    let id = user_id.to_string();
    let exists = tokio::task::spawn_blocking(move || db.get_user_by_id(&id))
        .await
        .map_err(join_error)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_some();
    if exists { Ok(()) } else { Err(StatusCode::NOT_FOUND) }
}
