use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{db::DbError, observability::metrics, providers::OpenAiErrorResponse};

/// Errors from the chat log query routes.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Database(DbError),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => ApiError::NotFound("Resource not found".to_string()),
            DbError::Validation(msg) => ApiError::Validation(msg),
            _ => ApiError::Database(err),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Database(err) => {
                // Storage details stay in the logs.
                tracing::error!(error = %err, "Chat log query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "An internal error occurred".to_string(),
                )
            }
        };
        metrics::record_gateway_error("api", code);

        let body = OpenAiErrorResponse::new(message, code, Some(code.to_string()));
        (status, Json(body)).into_response()
    }
}
