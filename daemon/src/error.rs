//! Error-to-status mapping for the engine API.

use andock_core::error::AndockError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Handler result.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Docker error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// A runtime error on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub AndockError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(AndockError::InvalidRequest(message.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        status_for(&self.0)
    }
}

impl From<AndockError> for ApiError {
    fn from(err: AndockError) -> Self {
        Self(err)
    }
}

/// HTTP status for a runtime error.
pub fn status_for(err: &AndockError) -> StatusCode {
    match err {
        AndockError::NotFound { .. } => StatusCode::NOT_FOUND,
        AndockError::InvalidStateTransition { .. } | AndockError::Conflict(_) => {
            StatusCode::CONFLICT
        }
        AndockError::InvalidRequest(_)
        | AndockError::Config(_)
        | AndockError::NoMatchingPlatform { .. } => StatusCode::BAD_REQUEST,
        AndockError::Auth { .. } => StatusCode::UNAUTHORIZED,
        AndockError::Network { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "Request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), error = %self.0, "Request rejected");
        }
        let body = ErrorResponse {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AndockError::not_found("container", "abc"), StatusCode::NOT_FOUND),
            (
                AndockError::InvalidStateTransition {
                    id: "abc".into(),
                    from: "created".into(),
                    operation: "stop",
                },
                StatusCode::CONFLICT,
            ),
            (AndockError::Conflict("name".into()), StatusCode::CONFLICT),
            (AndockError::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
            (
                AndockError::Auth {
                    endpoint: "https://r.io".into(),
                    message: "denied".into(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (
                AndockError::Network {
                    endpoint: "https://r.io".into(),
                    message: "down".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                AndockError::Cancelled("pull".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AndockError::Disk("full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err}");
        }
    }

    #[test]
    fn test_error_message_names_the_resource() {
        let err = ApiError::from(AndockError::not_found("container", "web"));
        assert_eq!(err.0.to_string(), "No such container: web");
    }
}
