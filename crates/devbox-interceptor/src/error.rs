use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Reasons an admission request is refused.
#[derive(Debug, Error)]
pub enum MutateError {
    #[error("invalid content type")]
    ContentType,

    #[error("invalid request")]
    EmptyBody,

    #[error("invalid request: {0}")]
    InvalidReview(String),

    #[error("invalid request: empty")]
    MissingRequest,

    #[error("invalid resource: {0}")]
    NotAPod(String),

    #[error("invalid pod provided: {0}")]
    InvalidPod(String),

    #[error("failed to build patch for changes: {0}")]
    Patch(String),
}

impl MutateError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Patch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for MutateError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
