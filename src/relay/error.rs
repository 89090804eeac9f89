use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    ledger::LedgerError,
    observability::metrics,
    pricing::PricingError,
    providers::{ApiType, ProviderError, error::OpenAiErrorResponse},
    routing::RoutingError,
};

/// Why a relay call failed.
///
/// Errors raised after a hold was placed release that hold; the pipeline does
/// this before returning the error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("sensitive words detected: {}", words.join(", "))]
    PolicyViolation { words: Vec<String> },

    /// `account` is "user" or "token".
    #[error("{account} quota is not enough")]
    InsufficientQuota { account: &'static str },

    /// Non-2xx from the upstream. `status` is already remapped for the client.
    #[error("{message}")]
    Upstream {
        status: u16,
        code: Option<String>,
        message: String,
        error_type: String,
    },

    #[error("upstream request failed: {message}")]
    Transport { message: String, timed_out: bool },

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("quota ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("no available channel for model {model} under group {group}")]
    ChannelNotFound { model: String, group: String },

    #[error("no adaptor registered for api type {0}")]
    AdaptorNotFound(ApiType),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) | RelayError::PolicyViolation { .. } => {
                StatusCode::BAD_REQUEST
            }
            RelayError::InsufficientQuota { .. } => StatusCode::FORBIDDEN,
            RelayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::Transport { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Transport { .. } | RelayError::Decode(_) => StatusCode::BAD_GATEWAY,
            RelayError::Ledger(_) | RelayError::AdaptorNotFound(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::ChannelNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::PolicyViolation { .. } => "sensitive_words_detected",
            RelayError::InsufficientQuota { account: "token" } => "insufficient_token_quota",
            RelayError::InsufficientQuota { .. } => "insufficient_user_quota",
            RelayError::Upstream { code, .. } => code.as_deref().unwrap_or("upstream_error"),
            RelayError::Transport { timed_out: true, .. } => "upstream_timeout",
            RelayError::Transport { .. } => "upstream_unreachable",
            RelayError::Decode(_) => "bad_response_body",
            RelayError::Ledger(_) => "quota_ledger_error",
            RelayError::ChannelNotFound { .. } => "model_not_available",
            RelayError::AdaptorNotFound(_) => "adaptor_not_found",
        }
    }

    fn error_type(&self) -> &str {
        match self {
            RelayError::InvalidRequest(_) | RelayError::PolicyViolation { .. } => {
                "invalid_request_error"
            }
            RelayError::InsufficientQuota { .. } => "insufficient_quota",
            RelayError::Upstream { error_type, .. } => error_type,
            RelayError::Transport { .. } | RelayError::Decode(_) => "upstream_error",
            RelayError::Ledger(_)
            | RelayError::ChannelNotFound { .. }
            | RelayError::AdaptorNotFound(_) => "server_error",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::PolicyViolation { .. } => "policy_violation",
            RelayError::InsufficientQuota { .. } => "insufficient_quota",
            RelayError::Upstream { .. } => "upstream",
            RelayError::Transport { .. } => "transport",
            RelayError::Decode(_) => "decode",
            RelayError::Ledger(_) => "ledger",
            RelayError::ChannelNotFound { .. } => "channel_not_found",
            RelayError::AdaptorNotFound(_) => "adaptor_not_found",
        }
    }
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transport { message, timed_out } => {
                RelayError::Transport { message, timed_out }
            }
            ProviderError::Decode(message) => RelayError::Decode(message),
            ProviderError::Upstream {
                status,
                code,
                message,
                error_type,
            } => RelayError::Upstream {
                status,
                code,
                message,
                error_type,
            },
            ProviderError::InvalidRequest(message) => RelayError::InvalidRequest(message),
        }
    }
}

impl From<PricingError> for RelayError {
    fn from(err: PricingError) -> Self {
        RelayError::InvalidRequest(err.to_string())
    }
}

impl From<RoutingError> for RelayError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NoChannel { model, group } => RelayError::ChannelNotFound { model, group },
            other => RelayError::InvalidRequest(other.to_string()),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        metrics::record_gateway_error(self.kind(), self.code());

        // Internal details stay in the logs
        let message = match &self {
            RelayError::Ledger(e) => {
                tracing::error!(error = %e, "Quota ledger failure before dispatch");
                "quota ledger unavailable".to_string()
            }
            other => other.to_string(),
        };

        let body = OpenAiErrorResponse::new(
            message,
            self.error_type(),
            Some(self.code().to_string()),
        );
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::ledger::AccountId;

    #[rstest]
    #[case(RelayError::InvalidRequest("x".into()), 400)]
    #[case(RelayError::PolicyViolation { words: vec!["bad".into()] }, 400)]
    #[case(RelayError::InsufficientQuota { account: "user" }, 403)]
    #[case(RelayError::Transport { message: "x".into(), timed_out: false }, 502)]
    #[case(RelayError::Transport { message: "x".into(), timed_out: true }, 504)]
    #[case(RelayError::Decode("x".into()), 502)]
    #[case(RelayError::Ledger(LedgerError::UnknownAccount(AccountId::User(1))), 500)]
    #[case(RelayError::ChannelNotFound { model: "m".into(), group: "g".into() }, 503)]
    #[case(RelayError::AdaptorNotFound(ApiType::Test), 500)]
    fn test_status_codes(#[case] error: RelayError, #[case] status: u16) {
        assert_eq!(error.status().as_u16(), status);
    }

    #[test]
    fn test_upstream_keeps_remapped_status() {
        let error = RelayError::Upstream {
            status: 503,
            code: Some("rate_limit_exceeded".into()),
            message: "slow down".into(),
            error_type: "rate_limit_error".into(),
        };
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_policy_violation_body() {
        let error = RelayError::PolicyViolation {
            words: vec!["foo".into(), "bar".into()],
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "sensitive_words_detected");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("foo, bar"));
    }

    #[test]
    fn test_provider_error_conversion() {
        let error: RelayError = ProviderError::Transport {
            message: "reset".into(),
            timed_out: true,
        }
        .into();
        assert_eq!(error.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_unpriced_model_is_invalid_request() {
        let error: RelayError = PricingError::ModelNotPriced("mystery".into()).into();
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }
}
