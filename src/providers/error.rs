//! Upstream error handling.
//!
//! Adaptors translate whatever an upstream returns on failure into a
//! [`ProviderError`], and the relay renders every client-facing error as an
//! OpenAI-compatible body regardless of which provider produced it.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OpenAI-compatible error types.
///
/// These map to the `type` field in OpenAI's error response format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiErrorType {
    /// Invalid parameters, malformed request, model not found, validation errors.
    InvalidRequest,
    /// Invalid API key, unauthorized access, permission denied.
    Authentication,
    /// Rate limit exceeded, quota exceeded, too many requests.
    RateLimit,
    /// Internal server error, timeout, service unavailable.
    Server,
    /// Catch-all for other provider-specific errors.
    Api,
}

impl OpenAiErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::Authentication => "authentication_error",
            Self::RateLimit => "rate_limit_error",
            Self::Server => "server_error",
            Self::Api => "api_error",
        }
    }

    /// Best guess at an error type when the upstream body carries none.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 | 404 | 422 => Self::InvalidRequest,
            401 | 403 => Self::Authentication,
            429 => Self::RateLimit,
            500..=599 => Self::Server,
            _ => Self::Api,
        }
    }
}

impl std::fmt::Display for OpenAiErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors an adaptor can return.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The upstream could not be reached, or the connection failed mid-body.
    #[error("upstream request failed: {message}")]
    Transport { message: String, timed_out: bool },

    /// The upstream answered 2xx but the body could not be understood.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// The upstream answered with a non-2xx status.
    #[error("upstream error ({status}): {message}")]
    Upstream {
        status: u16,
        code: Option<String>,
        message: String,
        error_type: String,
    },

    /// The request cannot be expressed for this upstream.
    #[error("{0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn timed_out(&self) -> bool {
        matches!(self, ProviderError::Transport { timed_out: true, .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ProviderError::Decode(err.to_string());
        }
        ProviderError::Transport {
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Decode(err.to_string())
    }
}

/// OpenAI-compatible error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiErrorBody,
}

/// OpenAI-compatible error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: Option<String>,
}

impl OpenAiErrorResponse {
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        Self {
            error: OpenAiErrorBody {
                message: message.into(),
                error_type: error_type.into(),
                code,
            },
        }
    }
}

/// Trait for parsing provider-specific error responses.
///
/// Implement this for each upstream wire format to extract error information
/// from its failure bodies.
pub trait ProviderErrorParser {
    fn parse_error(status: StatusCode, headers: &http::HeaderMap, body: &[u8]) -> ProviderError;
}

/// Parser for OpenAI-shaped error bodies.
///
/// `{"error": {"message": "...", "type": "...", "code": "..."}}`. Some
/// compatible upstreams send a numeric code, a bare `{"message": ...}`, or a
/// plain-text body; all are accepted.
pub struct OpenAiErrorParser;

impl ProviderErrorParser for OpenAiErrorParser {
    fn parse_error(status: StatusCode, _headers: &http::HeaderMap, body: &[u8]) -> ProviderError {
        let json: serde_json::Value =
            serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
        let error = json.get("error").unwrap_or(&json);

        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
            .unwrap_or_else(|| {
                let text = String::from_utf8_lossy(body).trim().to_string();
                if text.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("upstream error")
                        .to_string()
                } else {
                    text
                }
            });

        let code = error.get("code").and_then(|c| match c {
            serde_json::Value::String(s) => Some(s.to_lowercase()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        let error_type = error
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| OpenAiErrorType::from_status(status).to_string());

        ProviderError::Upstream {
            status: status.as_u16(),
            code,
            message,
            error_type,
        }
    }
}
