use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};

use vesper_engine::AttachmentStore;
use vesper_types::api::AttachmentUploadResponse;

use crate::auth::AppState;
use crate::error::ApiError;

/// Upload an attachment blob ahead of the send. The response reference goes
/// into `SendMessageRequest.attachments`.
pub async fn upload(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let attachment = state.attachments.store(mime, body.to_vec()).await?;
    Ok((StatusCode::CREATED, Json(AttachmentUploadResponse { attachment })))
}

/// Serve a stored blob by digest. Content addressing makes these immutable,
/// so clients may cache forever.
pub async fn download(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let bytes = state
        .attachments
        .read(&digest)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
        ],
        bytes,
    ))
}
