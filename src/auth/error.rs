use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{observability::metrics, providers::OpenAiErrorResponse};

#[derive(Debug)]
pub enum AuthError {
    /// No `Authorization` header, or not a bearer credential.
    MissingCredentials,

    /// Key not found. Deliberately generic so keys cannot be enumerated.
    InvalidApiKey,

    /// Authenticated, but not allowed here.
    Forbidden(String),
}

impl AuthError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            AuthError::MissingCredentials => (
                StatusCode::UNAUTHORIZED,
                "missing_credentials",
                "authentication_error",
            ),
            AuthError::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "authentication_error",
            ),
            AuthError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", "permission_error"),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, error_type) = self.parts();
        metrics::record_gateway_error("auth_failure", code);

        let body = OpenAiErrorResponse::new(self.to_string(), error_type, Some(code.to_string()));
        (status, Json(body)).into_response()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingCredentials => write!(f, "Authentication credentials required"),
            AuthError::InvalidApiKey => write!(f, "Invalid API key"),
            AuthError::Forbidden(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for AuthError {}
