use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use vesper_types::error::SendError;

/// HTTP rendering of the send failure taxonomy. The request-limit case gets
/// a distinct status so clients can show "request sent, awaiting
/// reciprocity" instead of a generic failure; blocked pairs share a status
/// with plain bad requests on purpose.
pub struct ApiError(pub SendError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SendError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SendError::PermissionDenied => StatusCode::BAD_REQUEST,
            SendError::RequestLimitExceeded => StatusCode::CONFLICT,
            SendError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SendError::UnknownConversation(_) => StatusCode::NOT_FOUND,
            SendError::NotParticipant(_) => StatusCode::FORBIDDEN,
            SendError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let retry_after_secs = match &self.0 {
            SendError::RateLimited { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            retry_after_secs,
        };
        (status, Json(body)).into_response()
    }
}

impl From<SendError> for ApiError {
    fn from(err: SendError) -> Self {
        Self(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vesper_types::error::ValidationError;

    fn status_of(err: SendError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn statuses_match_the_taxonomy() {
        assert_eq!(
            status_of(SendError::Validation(ValidationError::EmptyPayload)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(SendError::PermissionDenied), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(SendError::RequestLimitExceeded), StatusCode::CONFLICT);
        assert_eq!(
            status_of(SendError::RateLimited { retry_after: Duration::from_secs(3) }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(SendError::UnknownConversation(uuid::Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SendError::NotParticipant(uuid::Uuid::new_v4())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_of(SendError::Storage("down".into())), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn blocked_and_generic_failures_are_indistinguishable() {
        // The body must not let a client probe for blocks.
        let response = ApiError(SendError::PermissionDenied).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
