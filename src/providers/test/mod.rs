//! In-process mock adaptors.
//!
//! [`TestAdaptor`] answers every call locally with canned OpenAI-shaped
//! responses, so the whole relay pipeline can be exercised without a network.
//! Magic model names (optionally prefixed with `test/`) select failure modes:
//!
//! | model | behavior |
//! |---|---|
//! | `error-429`, `error-500`, `error-502`, `error-503`, `error-504` | upstream replies with that status |
//! | `error-timeout` | transport error flagged as a timeout |
//! | `error-connection` | transport error |
//! | `no-usage` | no usage is reported, buffered or streamed |
//! | `stream-abort` | the stream fails after two chunks |
//! | `web-search` | Responses output includes one `web_search_call` |

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use http::{HeaderMap, StatusCode};
use serde_json::{Value, json};

use crate::{
    api_types::{GeneralRequest, RelayMode},
    providers::{
        Adaptor, AdaptorContext, ParsedResponse, ProviderError, RawResponse, TaskAdaptor,
        TaskPlatform, TaskStatus, UpstreamTarget, parse_openai_body,
    },
};

/// Prompt tokens reported for every successful call.
pub const TEST_PROMPT_TOKENS: i64 = 10;
/// The reply, streamed one word per chunk.
pub const TEST_REPLY_CHUNKS: [&str; 5] = ["Hello", " from", " the", " test", " adaptor."];
/// Completion tokens reported for every successful call.
pub const TEST_COMPLETION_TOKENS: i64 = TEST_REPLY_CHUNKS.len() as i64;

/// Mock adaptor for the `test` API type.
#[derive(Debug, Default)]
pub struct TestAdaptor;

impl TestAdaptor {
    pub fn new() -> Self {
        Self
    }
}

fn reply_text() -> String {
    TEST_REPLY_CHUNKS.concat()
}

fn generate_id() -> String {
    format!("test-{}", uuid::Uuid::new_v4())
}

fn usage_json() -> Value {
    json!({
        "prompt_tokens": TEST_PROMPT_TOKENS,
        "completion_tokens": TEST_COMPLETION_TOKENS,
        "total_tokens": TEST_PROMPT_TOKENS + TEST_COMPLETION_TOKENS
    })
}

fn error_body(status_code: u16, message: &str) -> RawResponse {
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    RawResponse::from_bytes(
        status,
        "application/json",
        Bytes::from(
            json!({
                "error": {
                    "message": message,
                    "type": "test_error",
                    "code": status_code
                }
            })
            .to_string(),
        ),
    )
}

/// Replies for magic error models, if `model` is one.
fn check_magic_error_model(model: &str) -> Option<Result<RawResponse, ProviderError>> {
    match model {
        "error-500" => Some(Ok(error_body(500, "Internal Server Error"))),
        "error-503" => Some(Ok(error_body(503, "Service Unavailable"))),
        "error-429" => Some(Ok(error_body(429, "Too Many Requests"))),
        "error-502" => Some(Ok(error_body(502, "Bad Gateway"))),
        "error-504" => Some(Ok(error_body(504, "Gateway Timeout"))),
        "error-timeout" => Some(Err(ProviderError::Transport {
            message: "operation timed out".into(),
            timed_out: true,
        })),
        "error-connection" => Some(Err(ProviderError::Transport {
            message: "connection refused".into(),
            timed_out: false,
        })),
        _ => None,
    }
}

fn sse(event: Option<&str>, data: &Value) -> String {
    match event {
        Some(event) => format!("event: {event}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

fn stream_events(mode: RelayMode, model: &str, include_usage: bool) -> Vec<String> {
    let id = generate_id();
    let created = chrono::Utc::now().timestamp();
    let mut events = Vec::new();

    if mode == RelayMode::Responses {
        for delta in TEST_REPLY_CHUNKS {
            events.push(sse(
                Some("response.output_text.delta"),
                &json!({"type": "response.output_text.delta", "delta": delta}),
            ));
        }
        if model == "web-search" {
            events.push(sse(
                Some("response.output_item.done"),
                &json!({"type": "response.output_item.done", "item": {"type": "web_search_call", "status": "completed"}}),
            ));
        }
        let mut response = json!({"id": id, "status": "completed", "model": model});
        if include_usage {
            response["usage"] = json!({
                "input_tokens": TEST_PROMPT_TOKENS,
                "output_tokens": TEST_COMPLETION_TOKENS,
                "total_tokens": TEST_PROMPT_TOKENS + TEST_COMPLETION_TOKENS
            });
        }
        events.push(sse(
            Some("response.completed"),
            &json!({"type": "response.completed", "response": response}),
        ));
        return events;
    }

    let chunk = |choice: Value| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [choice]
        })
    };
    for delta in TEST_REPLY_CHUNKS {
        let choice = if mode == RelayMode::Completions {
            json!({"index": 0, "text": delta, "finish_reason": null})
        } else {
            json!({"index": 0, "delta": {"content": delta}, "finish_reason": null})
        };
        events.push(sse(None, &chunk(choice)));
    }
    events.push(sse(
        None,
        &chunk(json!({"index": 0, "delta": {}, "finish_reason": "stop"})),
    ));
    if include_usage {
        events.push(sse(
            None,
            &json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [],
                "usage": usage_json()
            }),
        ));
    }
    events.push("data: [DONE]\n\n".to_string());
    events
}

fn buffered_body(mode: RelayMode, model: &str, request: &Value, include_usage: bool) -> Value {
    let created = chrono::Utc::now().timestamp();
    let mut body = match mode {
        RelayMode::Embeddings => {
            let inputs = match request.get("input") {
                Some(Value::Array(items)) => items.len(),
                _ => 1,
            };
            let data: Vec<Value> = (0..inputs)
                .map(|index| json!({"object": "embedding", "index": index, "embedding": vec![0.0_f64; 8]}))
                .collect();
            json!({"object": "list", "model": model, "data": data})
        }
        RelayMode::Moderations => json!({
            "id": generate_id(),
            "model": model,
            "results": [{"flagged": false, "categories": {}, "category_scores": {}}]
        }),
        RelayMode::Completions | RelayMode::Edits => json!({
            "id": generate_id(),
            "object": "text_completion",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "text": reply_text(), "finish_reason": "stop"}]
        }),
        RelayMode::Responses => {
            let mut output = Vec::new();
            if model == "web-search" {
                output.push(json!({"type": "web_search_call", "status": "completed"}));
            }
            output.push(json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": reply_text()}]
            }));
            json!({"id": generate_id(), "object": "response", "model": model, "output": output})
        }
        _ => json!({
            "id": generate_id(),
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": reply_text()},
                "finish_reason": "stop"
            }]
        }),
    };

    if include_usage {
        body["usage"] = if mode == RelayMode::Responses {
            json!({
                "input_tokens": TEST_PROMPT_TOKENS,
                "output_tokens": TEST_COMPLETION_TOKENS,
                "total_tokens": TEST_PROMPT_TOKENS + TEST_COMPLETION_TOKENS
            })
        } else {
            usage_json()
        };
    }
    body
}

#[async_trait]
impl Adaptor for TestAdaptor {
    fn name(&self) -> &'static str {
        "test"
    }

    fn init(&self, ctx: &AdaptorContext<'_>) -> Result<UpstreamTarget, ProviderError> {
        Ok(UpstreamTarget {
            url: format!("test://channel-{}{}", ctx.channel.id, ctx.mode.openai_path()),
            headers: HeaderMap::new(),
            timeout: ctx.channel.timeout(),
        })
    }

    fn translate_request(
        &self,
        ctx: &AdaptorContext<'_>,
        request: &GeneralRequest,
    ) -> Result<Value, ProviderError> {
        let mut body = serde_json::to_value(request)?;
        body["model"] = Value::String(ctx.upstream_model.to_string());
        Ok(body)
    }

    async fn dispatch(
        &self,
        _client: &reqwest::Client,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> Result<RawResponse, ProviderError> {
        let request: Value = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid test request: {e}")))?;
        let model = request
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("test-model");
        let model = model.strip_prefix("test/").unwrap_or(model).to_string();

        if let Some(reply) = check_magic_error_model(&model) {
            return reply;
        }

        let mode = RelayMode::from_path(&target.url);
        let stream = request.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let include_usage = model != "no-usage";

        if !stream {
            let reply = buffered_body(mode, &model, &request, include_usage);
            return Ok(RawResponse::from_bytes(
                StatusCode::OK,
                "application/json",
                Bytes::from(reply.to_string()),
            ));
        }

        let events = stream_events(mode, &model, include_usage);
        let abort = model == "stream-abort";
        let body = futures::stream::iter(events.into_iter().enumerate())
            .then(move |(index, event)| async move {
                // Yield so consumers observe chunk boundaries.
                tokio::time::sleep(Duration::from_millis(1)).await;
                if abort && index == 2 {
                    Err(ProviderError::Transport {
                        message: "upstream closed the connection".into(),
                        timed_out: false,
                    })
                } else {
                    Ok(Bytes::from(event))
                }
            })
            .boxed();

        let mut raw = RawResponse::from_bytes(StatusCode::OK, "text/event-stream", Bytes::new());
        raw.body = body;
        Ok(raw)
    }

    async fn parse_response(
        &self,
        ctx: &AdaptorContext<'_>,
        raw: RawResponse,
    ) -> Result<ParsedResponse, ProviderError> {
        let status = raw.status;
        let body = raw.collect(ctx.max_response_body_bytes).await?;
        parse_openai_body(status, body)
    }
}

/// Mock task platform: a submitted task is in progress on the first poll and
/// succeeds on the second.
#[derive(Debug, Default)]
pub struct TestTaskAdaptor {
    polls: DashMap<String, u32>,
}

impl TestTaskAdaptor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskAdaptor for TestTaskAdaptor {
    fn platform(&self) -> TaskPlatform {
        TaskPlatform::Test
    }

    fn validate_task(&self, request: &Value) -> Result<(), ProviderError> {
        match request.get("prompt").and_then(Value::as_str) {
            Some(prompt) if !prompt.trim().is_empty() => Ok(()),
            _ => Err(ProviderError::InvalidRequest("prompt is required".into())),
        }
    }

    fn build_task_request(
        &self,
        request: &Value,
        upstream_model: &str,
    ) -> Result<Value, ProviderError> {
        self.validate_task(request)?;
        let mut body = request.clone();
        body["model"] = Value::String(upstream_model.to_string());
        Ok(body)
    }

    async fn submit(
        &self,
        _client: &reqwest::Client,
        _target: &UpstreamTarget,
        body: Bytes,
    ) -> Result<String, ProviderError> {
        let request: Value = serde_json::from_slice(&body)?;
        self.validate_task(&request)?;
        let task_id = format!("task-{}", uuid::Uuid::new_v4().simple());
        self.polls.insert(task_id.clone(), 0);
        Ok(task_id)
    }

    async fn fetch_status(
        &self,
        _client: &reqwest::Client,
        _target: &UpstreamTarget,
        task_id: &str,
    ) -> Result<TaskStatus, ProviderError> {
        let Some(mut polls) = self.polls.get_mut(task_id) else {
            return Err(ProviderError::Upstream {
                status: 404,
                code: Some("task_not_found".into()),
                message: format!("task {task_id} not found"),
                error_type: "invalid_request_error".into(),
            });
        };
        *polls += 1;
        Ok(if *polls == 1 {
            TaskStatus::InProgress { progress: 50 }
        } else {
            TaskStatus::Succeeded {
                result: json!({"url": format!("test://tasks/{task_id}.mp3")}),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api_types::{Message, ResponsePayload},
        config::ChannelConfig,
        providers::ApiType,
    };

    async fn call(model: &str, mode: RelayMode, stream: bool) -> Result<RawResponse, ProviderError> {
        let channel = ChannelConfig::for_tests(7, ApiType::Test, None, &[model]);
        let ctx = AdaptorContext {
            mode,
            channel: &channel,
            upstream_model: model,
            is_stream: stream,
            max_response_body_bytes: 1 << 20,
        };
        let request = GeneralRequest {
            model: model.into(),
            messages: Some(vec![Message::text("user", "hi")]),
            stream: Some(stream),
            ..Default::default()
        };
        let adaptor = TestAdaptor::new();
        let target = adaptor.init(&ctx)?;
        let body = adaptor.translate_request(&ctx, &request)?;
        adaptor
            .dispatch(&reqwest::Client::new(), &target, Bytes::from(body.to_string()))
            .await
    }

    #[tokio::test]
    async fn test_buffered_chat_reports_usage() {
        let raw = call("test-model", RelayMode::ChatCompletions, false).await.unwrap();
        let parsed = parse_openai_body(raw.status, raw.collect(1 << 20).await.unwrap()).unwrap();

        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, TEST_PROMPT_TOKENS);
        assert_eq!(usage.completion_tokens, TEST_COMPLETION_TOKENS);
        assert!(matches!(
            parsed.payload,
            ResponsePayload::Text { ref content, .. } if content == "Hello from the test adaptor."
        ));
    }

    #[tokio::test]
    async fn test_magic_error_models() {
        let raw = call("test/error-503", RelayMode::ChatCompletions, false).await.unwrap();
        assert_eq!(raw.status, StatusCode::SERVICE_UNAVAILABLE);

        let err = call("error-timeout", RelayMode::ChatCompletions, false)
            .await
            .unwrap_err();
        assert!(err.timed_out());
    }

    #[tokio::test]
    async fn test_stream_emits_chunks_then_done() {
        let raw = call("test-model", RelayMode::ChatCompletions, true).await.unwrap();
        assert!(raw.is_event_stream());

        let chunks: Vec<_> = raw.body.collect().await;
        assert_eq!(chunks.len(), TEST_REPLY_CHUNKS.len() + 3);
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert_eq!(last.as_ref(), b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_stream_abort_fails_mid_stream() {
        let raw = call("stream-abort", RelayMode::ChatCompletions, true).await.unwrap();
        let chunks: Vec<_> = raw.body.collect().await;
        assert!(chunks[0].is_ok());
        assert!(chunks[2].is_err());
    }

    #[tokio::test]
    async fn test_embeddings_count_inputs() {
        let raw = call("test-embed", RelayMode::Embeddings, false).await.unwrap();
        let parsed = parse_openai_body(raw.status, raw.collect(1 << 20).await.unwrap()).unwrap();
        assert_eq!(parsed.payload, ResponsePayload::Embedding { vectors: 1 });
    }

    #[tokio::test]
    async fn test_task_adaptor_lifecycle() {
        let adaptor = TestTaskAdaptor::new();
        let target = UpstreamTarget {
            url: "test://tasks".into(),
            headers: HeaderMap::new(),
            timeout: Duration::from_secs(1),
        };
        let client = reqwest::Client::new();

        assert!(adaptor.validate_task(&json!({"prompt": " "})).is_err());

        let body = adaptor
            .build_task_request(&json!({"prompt": "lofi beat"}), "suno-v4")
            .unwrap();
        assert_eq!(body["model"], "suno-v4");

        let task_id = adaptor
            .submit(&client, &target, Bytes::from(body.to_string()))
            .await
            .unwrap();
        assert_eq!(
            adaptor.fetch_status(&client, &target, &task_id).await.unwrap(),
            TaskStatus::InProgress { progress: 50 }
        );
        assert!(
            adaptor
                .fetch_status(&client, &target, &task_id)
                .await
                .unwrap()
                .is_terminal()
        );
        assert!(adaptor.fetch_status(&client, &target, "nope").await.is_err());
    }
}
