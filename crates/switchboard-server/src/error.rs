use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use switchboard_engine::{IsolationError, OrchestrationError};
use switchboard_store::StoreError;

/// Errors returned from HTTP handlers as `{"error": {"type", "message"}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("log query failed: {0}")]
    Logs(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Orchestration(e.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Logs(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Orchestration(e) => match e {
                OrchestrationError::Isolation(IsolationError::Apply(_)) => StatusCode::BAD_GATEWAY,
                OrchestrationError::Isolation(_) => StatusCode::SERVICE_UNAVAILABLE,
                OrchestrationError::SessionBusy(_) => StatusCode::CONFLICT,
                OrchestrationError::SessionOwnership { .. } => StatusCode::FORBIDDEN,
                OrchestrationError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                OrchestrationError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                OrchestrationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                OrchestrationError::Engine(_) => StatusCode::BAD_GATEWAY,
                OrchestrationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::Logs(_) => "log_query",
            Self::Orchestration(e) => e.error_kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        // Store internals stay in the log.
        let message = match &self {
            Self::Orchestration(OrchestrationError::Store(StoreError::NotFound(what))) => format!("not found: {what}"),
            Self::Orchestration(OrchestrationError::Store(_)) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        let body = json!({"error": {"type": self.error_type(), "message": message}});
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::ids::{SessionId, UserId};

    #[test]
    fn maps_orchestration_errors_to_status() {
        let cases = [
            (OrchestrationError::Isolation(IsolationError::Halted), StatusCode::SERVICE_UNAVAILABLE),
            (OrchestrationError::SessionBusy(SessionId::from_raw("s")), StatusCode::CONFLICT),
            (
                OrchestrationError::SessionOwnership {
                    session_id: SessionId::from_raw("s"),
                    user_id: UserId::from_raw("u"),
                },
                StatusCode::FORBIDDEN,
            ),
            (OrchestrationError::SessionNotFound(SessionId::from_raw("s")), StatusCode::NOT_FOUND),
            (OrchestrationError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn store_details_are_not_exposed() {
        let err = ApiError::from(StoreError::Database("disk I/O error at /var/db".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
