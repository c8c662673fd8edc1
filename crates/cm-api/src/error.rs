use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::auth::AuthError;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn unauthorized() -> Self {
        Self::new("UNAUTHORIZED", "Authentication required")
    }

    pub fn invalid_token() -> Self {
        Self::new("INVALID_TOKEN", "Invalid or expired token")
    }

    pub fn model_required() -> Self {
        Self::new("MODEL_REQUIRED", "Model is required")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message).retryable()
    }
}

#[derive(Debug)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub error: ApiError,
}

impl ApiErrorResponse {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("usage request failed: {}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ApiError::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self.error).unwrap_or_default();
        (self.status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<(StatusCode, ApiError)> for ApiErrorResponse {
    fn from((status, error): (StatusCode, ApiError)) -> Self {
        Self { status, error }
    }
}

impl From<AuthError> for ApiErrorResponse {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing => (StatusCode::UNAUTHORIZED, ApiError::unauthorized()).into(),
            AuthError::Expired | AuthError::Invalid(_) => {
                (StatusCode::UNAUTHORIZED, ApiError::invalid_token()).into()
            }
            AuthError::Signing(e) => Self::internal(e),
        }
    }
}
