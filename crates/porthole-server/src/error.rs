use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use porthole_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Invalid position")]
    ExpiredPos,

    #[error("Session expired")]
    ExpiredSession,

    /// A newer request on the same connection took over; no state was
    /// advanced on behalf of this one.
    #[error("Request superseded by a newer request")]
    Superseded,

    #[error("Upstream auth failed: {0}")]
    UpstreamAuth(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::ExpiredPos => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::ExpiredSession => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Superseded => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::UpstreamAuth(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServerError::Store(_) | ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
