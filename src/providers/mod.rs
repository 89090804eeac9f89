//! # Adaptors
//!
//! An adaptor turns a canonical [`GeneralRequest`] into one upstream family's
//! wire protocol and reads the reply back into usage plus a response payload.
//! Each call goes through the same four steps:
//!
//! ```ignore
//! let target = adaptor.init(&ctx)?;                       // URL, auth headers, timeout
//! let body = adaptor.translate_request(&ctx, &request)?;  // provider JSON
//! let raw = adaptor.dispatch(&client, &target, body).await?;
//! let parsed = adaptor.parse_response(&ctx, raw).await?;  // buffered calls only
//! ```
//!
//! Non-2xx replies are turned into [`ProviderError::Upstream`] by
//! [`Adaptor::parse_error`]; streaming replies are handed to
//! [`crate::streaming`] instead of `parse_response`.
//!
//! Adaptors hold no per-call state, so one instance serves every channel of
//! its family concurrently.

pub mod error;
#[cfg(feature = "provider-openai")]
pub mod open_ai;
pub mod registry;
#[cfg(any(test, feature = "provider-test"))]
pub mod test;

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
pub use error::{OpenAiErrorResponse, OpenAiErrorType, ProviderError, ProviderErrorParser};
use futures::{Stream, StreamExt, TryStreamExt};
use http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
pub use registry::{AdaptorRegistry, TaskAdaptor, TaskAdaptorRegistry, TaskPlatform, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    api_types::{GeneralRequest, RelayMode, ResponsePayload, ToolUsage, Usage},
    config::ChannelConfig,
};

/// Upstream families a channel can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    OpenAi,
    OpenRouter,
    DeepSeek,
    Xinference,
    SiliconFlow,
    Mistral,
    Moonshot,
    /// In-process mock; never touches the network.
    Test,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::OpenAi => "open_ai",
            ApiType::OpenRouter => "open_router",
            ApiType::DeepSeek => "deep_seek",
            ApiType::Xinference => "xinference",
            ApiType::SiliconFlow => "silicon_flow",
            ApiType::Mistral => "mistral",
            ApiType::Moonshot => "moonshot",
            ApiType::Test => "test",
        }
    }

    /// Public endpoint used when a channel does not set `base_url`.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ApiType::OpenAi => Some("https://api.openai.com"),
            ApiType::OpenRouter => Some("https://openrouter.ai/api"),
            ApiType::DeepSeek => Some("https://api.deepseek.com"),
            ApiType::SiliconFlow => Some("https://api.siliconflow.cn"),
            ApiType::Mistral => Some("https://api.mistral.ai"),
            ApiType::Moonshot => Some("https://api.moonshot.cn"),
            ApiType::Xinference | ApiType::Test => None,
        }
    }

    /// Self-hosted families have no public endpoint to fall back on.
    pub fn requires_base_url(&self) -> bool {
        matches!(self, ApiType::Xinference)
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an adaptor needs to know about the call it is serving.
#[derive(Debug, Clone, Copy)]
pub struct AdaptorContext<'a> {
    pub mode: RelayMode,
    pub channel: &'a ChannelConfig,
    /// Model name after `model_mapping`.
    pub upstream_model: &'a str,
    pub is_stream: bool,
    /// Cap on buffered response bodies.
    pub max_response_body_bytes: usize,
}

/// Where and how to send one upstream request.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub url: String,
    pub headers: HeaderMap,
    pub timeout: Duration,
}

/// Upstream body as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// An upstream reply before any interpretation.
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RawResponse {
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(ProviderError::from).boxed();
        Self {
            status,
            headers,
            body,
        }
    }

    /// A reply whose body is already in memory.
    pub fn from_bytes(status: StatusCode, content_type: &'static str, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, http::HeaderValue::from_static(content_type));
        Self {
            status,
            headers,
            body: futures::stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    }

    /// Read the whole body, failing once it grows past `limit` bytes.
    pub async fn collect(self, limit: usize) -> Result<Bytes, ProviderError> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(ProviderError::Decode(format!(
                    "response body exceeds {limit} bytes"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// A buffered upstream reply, read.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub status: StatusCode,
    /// `None` when the upstream reported no usage at all.
    pub usage: Option<Usage>,
    pub tools: ToolUsage,
    /// Server-side web searches reported in `usage.server_tool_use`
    /// (Claude-style upstreams).
    pub server_web_search_requests: u32,
    pub payload: ResponsePayload,
    /// Bytes to forward to the client.
    pub body: Bytes,
}

/// Protocol translation for one upstream family.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve the endpoint, auth headers and timeout for a call.
    fn init(&self, ctx: &AdaptorContext<'_>) -> Result<UpstreamTarget, ProviderError>;

    /// Build the provider request body.
    fn translate_request(
        &self,
        ctx: &AdaptorContext<'_>,
        request: &GeneralRequest,
    ) -> Result<Value, ProviderError>;

    /// Perform the upstream I/O. Any status is returned as-is; only failures to
    /// get a reply at all are errors.
    async fn dispatch(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> Result<RawResponse, ProviderError>;

    /// Read usage and content from a buffered 2xx reply.
    async fn parse_response(
        &self,
        ctx: &AdaptorContext<'_>,
        raw: RawResponse,
    ) -> Result<ParsedResponse, ProviderError>;

    /// Turn a non-2xx reply into an error.
    fn parse_error(&self, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ProviderError {
        error::OpenAiErrorParser::parse_error(status, headers, body)
    }
}

/// Read an OpenAI-shaped JSON body into usage, built-in tool calls and payload.
///
/// Shared by every adaptor whose upstream answers in the OpenAI format.
pub(crate) fn parse_openai_body(
    status: StatusCode,
    body: Bytes,
) -> Result<ParsedResponse, ProviderError> {
    let json: Value = serde_json::from_slice(&body)?;

    let usage = match json.get("usage") {
        Some(raw) if !raw.is_null() => {
            let mut usage: Usage = serde_json::from_value(raw.clone())?;
            usage.normalize();
            Some(usage)
        }
        _ => None,
    };

    // Responses API: built-in tools appear as typed output items.
    let mut tools = ToolUsage::default();
    if let Some(output) = json.get("output").and_then(Value::as_array) {
        for item in output {
            if let Some(tool) = item
                .get("type")
                .and_then(Value::as_str)
                .and_then(crate::streaming::builtin_tool_for_item)
            {
                tools.increment(tool);
            }
        }
    }

    let server_web_search_requests = json
        .pointer("/usage/server_tool_use/web_search_requests")
        .and_then(Value::as_u64)
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));

    Ok(ParsedResponse {
        status,
        usage,
        tools,
        server_web_search_requests,
        payload: ResponsePayload::from_json(json),
        body,
    })
}

/// Join a channel base URL and an API path without doubling slashes or `/v1`.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    match path.strip_prefix("/v1") {
        Some(rest) if base.ends_with("/v1") => format!("{base}{rest}"),
        _ => format!("{base}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_api_type_serde_names() {
        let parsed: ApiType = serde_json::from_value(json!("open_router")).unwrap();
        assert_eq!(parsed, ApiType::OpenRouter);
        assert_eq!(
            serde_json::to_value(ApiType::DeepSeek).unwrap(),
            json!("deep_seek")
        );
        assert!(ApiType::Xinference.requires_base_url());
        assert!(!ApiType::OpenAi.requires_base_url());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://api.openai.com/", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("http://localhost:9997/v1", "/v1/embeddings"),
            "http://localhost:9997/v1/embeddings"
        );
    }

    #[tokio::test]
    async fn test_collect_enforces_limit() {
        let raw = RawResponse::from_bytes(
            StatusCode::OK,
            "application/json",
            Bytes::from_static(b"0123456789"),
        );
        assert!(matches!(
            raw.collect(4).await,
            Err(ProviderError::Decode(_))
        ));

        let raw = RawResponse::from_bytes(
            StatusCode::OK,
            "text/event-stream; charset=utf-8",
            Bytes::from_static(b"data: {}\n\n"),
        );
        assert!(raw.is_event_stream());
        assert_eq!(raw.collect(1024).await.unwrap().len(), 10);
    }

    #[test]
    fn test_parse_openai_body_reads_usage_and_tools() {
        let body = json!({
            "output": [
                {"type": "web_search_call", "status": "completed"},
                {"type": "message", "content": []}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 30}
        });
        let parsed =
            parse_openai_body(StatusCode::OK, Bytes::from(body.to_string())).unwrap();

        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 42);
        assert_eq!(parsed.tools.count(crate::api_types::WEB_SEARCH_PREVIEW), 1);
        assert_eq!(parsed.server_web_search_requests, 0);
    }

    #[test]
    fn test_parse_openai_body_reads_server_web_searches() {
        let body = json!({
            "choices": [{"message": {"content": "found it"}}],
            "usage": {
                "prompt_tokens": 5,
                "completion_tokens": 2,
                "server_tool_use": {"web_search_requests": 3}
            }
        });
        let parsed =
            parse_openai_body(StatusCode::OK, Bytes::from(body.to_string())).unwrap();
        assert_eq!(parsed.server_web_search_requests, 3);
    }

    #[test]
    fn test_parse_openai_body_with_both_usage_spellings() {
        let body = json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 5,
                "completion_tokens": 2,
                "total_tokens": 7,
                "input_tokens": 5,
                "output_tokens": 2
            }
        });
        let parsed =
            parse_openai_body(StatusCode::OK, Bytes::from(body.to_string())).unwrap();

        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn test_parse_openai_body_without_usage() {
        let body = json!({"choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}]});
        let parsed =
            parse_openai_body(StatusCode::OK, Bytes::from(body.to_string())).unwrap();
        assert!(parsed.usage.is_none());
        assert!(matches!(parsed.payload, ResponsePayload::Text { .. }));
    }

    #[test]
    fn test_parse_openai_body_rejects_non_json() {
        let err = parse_openai_body(StatusCode::OK, Bytes::from_static(b"<html>")).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }
}
