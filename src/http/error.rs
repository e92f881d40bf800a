use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;

/// Error type for HTTP handlers.
///
/// Wraps [`Error`] and adds request-level variants. Renders as JSON
/// `{ "error": ..., "code": ... }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify(core),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify(err: &Error) -> (StatusCode, &'static str, String) {
    match err {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        Error::UnknownQueue(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_QUEUE", err.to_string()),
        Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "CONFLICT", err.to_string()),
        Error::Connection(e) => {
            tracing::error!(error = %e, "store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "The backing store is unavailable".to_string(),
            )
        }
        other => {
            tracing::error!(error = %other, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn domain_errors_map_to_status_codes() {
        assert_eq!(status_of(Error::NotFound("job".into()).into()), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(Error::UnknownQueue("nope".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(
                Error::InvalidTransition {
                    from: "completed".into(),
                    to: "active".into()
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::Connection(sqlx::Error::PoolTimedOut).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(Error::Other("boom".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::BadRequest("bad id".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
