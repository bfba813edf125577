use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use parley_shared::error::HubError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Blob not found: {0}")]
    BlobNotFound(Uuid),

    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Blob storage error: {0}")]
    BlobStorage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BlobNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BlobTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, self.to_string())
            }
            ServerError::BlobStorage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Blob storage error".to_string(),
            ),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Hub(e) => (hub_status(e), e.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn hub_status(e: &HubError) -> StatusCode {
    match e {
        HubError::NotMember | HubError::NotOwner => StatusCode::FORBIDDEN,
        HubError::AuthInvalid => StatusCode::UNAUTHORIZED,
        HubError::ConversationNotFound(_) | HubError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        HubError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        HubError::InvalidPayloadType(_) | HubError::AlreadyResolved(_) => StatusCode::BAD_REQUEST,
        HubError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
