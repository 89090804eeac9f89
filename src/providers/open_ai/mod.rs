use async_trait::async_trait;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use serde_json::{Value, json};

use crate::{
    api_types::{GeneralRequest, RelayMode},
    providers::{
        Adaptor, AdaptorContext, ParsedResponse, ProviderError, RawResponse, UpstreamTarget,
        join_url, parse_openai_body,
    },
};

/// Adaptor for OpenAI and every upstream that speaks its wire format.
///
/// Channels of OpenAI-shaped families (OpenRouter, DeepSeek, Xinference, ...)
/// differ only in base URL and key, so one instance serves all of them.
#[derive(Debug, Default)]
pub struct OpenAiAdaptor;

impl OpenAiAdaptor {
    pub fn new() -> Self {
        Self
    }

    fn supports(mode: RelayMode) -> bool {
        matches!(
            mode,
            RelayMode::ChatCompletions
                | RelayMode::Completions
                | RelayMode::Embeddings
                | RelayMode::Moderations
                | RelayMode::Edits
                | RelayMode::ImagesGenerations
                | RelayMode::AudioSpeech
                | RelayMode::Rerank
                | RelayMode::Responses
        )
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn init(&self, ctx: &AdaptorContext<'_>) -> Result<UpstreamTarget, ProviderError> {
        let channel = ctx.channel;
        let base_url = channel
            .base_url
            .as_deref()
            .or_else(|| channel.api_type.default_base_url())
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!(
                    "channel {} has no base_url configured",
                    channel.id
                ))
            })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if ctx.is_stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        if !channel.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", channel.api_key))
                .map_err(|_| {
                    ProviderError::InvalidRequest(format!(
                        "channel {} api_key is not a valid header value",
                        channel.id
                    ))
                })?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(UpstreamTarget {
            url: join_url(base_url, ctx.mode.openai_path()),
            headers,
            timeout: channel.timeout(),
        })
    }

    fn translate_request(
        &self,
        ctx: &AdaptorContext<'_>,
        request: &GeneralRequest,
    ) -> Result<Value, ProviderError> {
        if !Self::supports(ctx.mode) {
            return Err(ProviderError::InvalidRequest(format!(
                "{} requests are not supported by this channel",
                ctx.mode.request_type()
            )));
        }

        let mut body = serde_json::to_value(request)?;
        let Some(object) = body.as_object_mut() else {
            return Err(ProviderError::InvalidRequest(
                "request body must be a JSON object".into(),
            ));
        };
        object.insert("model".into(), Value::String(ctx.upstream_model.to_string()));

        // Ask for the trailing usage chunk so streamed calls bill exact counts.
        if ctx.is_stream
            && matches!(ctx.mode, RelayMode::ChatCompletions | RelayMode::Completions)
        {
            let options = object
                .entry("stream_options")
                .or_insert_with(|| json!({}));
            if let Some(options) = options.as_object_mut() {
                options.insert("include_usage".into(), Value::Bool(true));
            } else {
                *options = json!({ "include_usage": true });
            }
        }

        Ok(body)
    }

    #[tracing::instrument(skip(self, client, target, body), fields(adaptor = "openai", url = %target.url))]
    async fn dispatch(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> Result<RawResponse, ProviderError> {
        let response = client
            .post(&target.url)
            .headers(target.headers.clone())
            .timeout(target.timeout)
            .body(body)
            .send()
            .await?;

        Ok(RawResponse::from_reqwest(response))
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
