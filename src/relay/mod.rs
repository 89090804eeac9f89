//! The relay pipeline.
//!
//! One call moves through validation, pricing, pre-authorization, dispatch,
//! response handling and settlement. Every failure after a hold is placed
//! gives the hold back exactly once, on a background job.
//!
//! Buffered calls settle before the response is returned. Streaming calls
//! settle from the [`UsageTrackingStream`] end callback, which also fires when
//! the client disconnects mid-stream.

pub mod error;
pub mod info;
pub mod quota;
pub mod validate;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde_json::{Map, Value, json};
use tokio_util::task::TaskTracker;

pub use error::RelayError;
pub use info::{Caller, RelayCall, RequestMeta};
pub use quota::{Hold, QuotaService};

use crate::{
    api_types::{RelayMode, RequestPayload, ResponsePayload, ToolUsage, Usage},
    chat_log::ChatInteraction,
    config::{ChannelConfig, RelayConfig},
    content_policy::{self, ContentPolicy},
    jobs::JobQueue,
    models::ConsumeLogEntry,
    observability::metrics::{self, RelayRequestMetrics},
    pricing::{PriceQuote, PricingStore, compute_quota, estimate_quota},
    providers::{Adaptor, AdaptorContext, AdaptorRegistry, ByteStream, RawResponse},
    routing::ChannelTable,
    streaming::{IdleTimeoutStream, OnStreamEnd, StreamOutcome, UsageTrackingStream},
    tokenizer::{self, TokenCounter},
    usage_buffer::ConsumeLogBuffer,
};

/// Pipeline knobs taken from the gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct RelaySettings {
    pub relay: RelayConfig,
    /// Zero disables the idle timeout.
    pub streaming_idle_timeout: Duration,
    pub max_response_body_bytes: usize,
}

/// Collaborators needed to build a [`RelayPipeline`].
pub struct PipelineParts {
    pub settings: RelaySettings,
    pub channels: Arc<ChannelTable>,
    pub adaptors: Arc<AdaptorRegistry>,
    pub pricing: Arc<PricingStore>,
    pub counter: Arc<dyn TokenCounter>,
    pub policy: Option<Arc<dyn ContentPolicy>>,
    pub http: reqwest::Client,
    pub quota: QuotaService,
    pub consume_logs: Arc<ConsumeLogBuffer>,
    pub jobs: JobQueue,
    /// Streaming settlements only. Shutdown waits on it before stopping the
    /// job workers and the consume log buffer they feed.
    pub settlements: TaskTracker,
}

/// What a finished call consumed.
#[derive(Debug)]
pub struct Settlement {
    pub usage: Usage,
    pub tools: ToolUsage,
    pub claude_web_search_requests: u32,
    pub response: ResponsePayload,
}

/// Prices a finished call, reconciles its hold and records it.
#[derive(Clone)]
pub struct Settler {
    quota: QuotaService,
    consume_logs: Arc<ConsumeLogBuffer>,
    jobs: JobQueue,
}

impl Settler {
    /// Returns the authoritative cost. Ledger failures are logged with enough
    /// detail to reconcile by hand and never reach the client.
    pub async fn settle(
        &self,
        call: &RelayCall,
        quote: &PriceQuote,
        hold: &Hold,
        settlement: Settlement,
    ) -> i64 {
        let Settlement {
            usage,
            tools,
            claude_web_search_requests,
            response,
        } = settlement;

        let breakdown = compute_quota(
            quote,
            &usage,
            &tools,
            &call.origin_model,
            claude_web_search_requests,
        );
        let cost = breakdown.quota;

        match self.quota.settle(hold, cost).await {
            Ok(delta) => {
                tracing::debug!(
                    request_id = %call.request_id(),
                    hold = hold.amount,
                    cost,
                    delta,
                    trusted = hold.trusted,
                    "Quota settled"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    request_id = %call.request_id(),
                    user_id = hold.user_id,
                    token_id = hold.token_id,
                    hold = hold.amount,
                    cost,
                    "Quota settlement failed; ledger needs reconciliation"
                );
            }
        }

        metrics::record_quota_settled(
            &call.origin_model,
            usage.prompt_tokens,
            usage.completion_tokens,
            cost,
        );

        self.consume_logs.push(ConsumeLogEntry {
            user_id: call.caller.user_id,
            token_id: call.caller.token_id,
            channel_id: call.channel.id,
            model_name: call.origin_model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: cost,
            use_time_seconds: call.elapsed_secs(),
            is_stream: call.is_stream,
            content: breakdown.to_string(),
            request_id: call.meta.request_id.clone(),
            created_at: Utc::now(),
        });

        self.jobs.record_chat(ChatInteraction {
            user_id: call.caller.user_id,
            username: call.caller.username.clone(),
            token_id: call.caller.token_id,
            token_name: call.caller.token_name.clone(),
            model_name: call.origin_model.clone(),
            channel_id: call.channel.id,
            channel_name: call.channel.name.clone(),
            mode: call.mode,
            request: RequestPayload::from_request(call.mode, &call.request),
            response,
            conversation_id: call.request.conversation_id().map(str::to_string),
            conversation_header: call.meta.conversation_header.clone(),
            usage,
            quota: cost,
            use_time_seconds: call.elapsed_secs(),
            is_stream: call.is_stream,
            request_id: call.meta.request_id.clone(),
            user_ip: call.meta.client_ip.clone(),
            user_agent: call.meta.user_agent.clone(),
            other: Some(json!({
                "relay_mode": call.mode.request_type(),
                "api_type": call.channel.api_type.as_str(),
                "origin_model": call.origin_model,
                "upstream_model": call.upstream_model,
                "group": call.caller.group,
                "stream": call.is_stream,
            })),
        });

        cost
    }
}

/// A validated call that is priced and ready for pre-authorization.
struct Prepared {
    call: RelayCall,
    quote: PriceQuote,
    estimate: i64,
    adaptor: Arc<dyn Adaptor>,
}

#[derive(Clone)]
pub struct RelayPipeline {
    settings: Arc<RelaySettings>,
    channels: Arc<ChannelTable>,
    adaptors: Arc<AdaptorRegistry>,
    pricing: Arc<PricingStore>,
    counter: Arc<dyn TokenCounter>,
    policy: Option<Arc<dyn ContentPolicy>>,
    http: reqwest::Client,
    settler: Settler,
    settlements: TaskTracker,
}

impl RelayPipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            settings: Arc::new(parts.settings),
            channels: parts.channels,
            adaptors: parts.adaptors,
            pricing: parts.pricing,
            counter: parts.counter,
            policy: parts.policy,
            http: parts.http,
            settler: Settler {
                quota: parts.quota,
                consume_logs: parts.consume_logs,
                jobs: parts.jobs,
            },
            settlements: parts.settlements,
        }
    }

    pub fn pricing(&self) -> &Arc<PricingStore> {
        &self.pricing
    }

    pub fn quota(&self) -> &QuotaService {
        &self.settler.quota
    }

    /// Relay one client request to an upstream channel.
    #[tracing::instrument(
        name = "relay",
        skip_all,
        fields(
            request_id = %meta.request_id,
            user_id = caller.user_id,
            mode = mode.request_type(),
            model = tracing::field::Empty,
            channel_id = tracing::field::Empty,
        )
    )]
    pub async fn relay(
        &self,
        caller: Caller,
        meta: RequestMeta,
        mode: RelayMode,
        body: Bytes,
    ) -> Result<Response, RelayError> {
        let started_at = Instant::now();

        let prepared = match self.prepare(caller, meta, mode, &body, started_at) {
            Ok(prepared) => prepared,
            Err(e) => {
                observe(mode, "", "", false, started_at, &Err(e.status().as_u16()));
                return Err(e);
            }
        };

        let span = tracing::Span::current();
        span.record("model", prepared.call.origin_model.as_str());
        span.record("channel_id", prepared.call.channel.id);

        let model = prepared.call.origin_model.clone();
        let channel_type = prepared.call.channel.api_type.as_str();
        let is_stream = prepared.call.is_stream;

        let result = self.execute(prepared, body).await;
        let status = match &result {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) => Err(e.status().as_u16()),
        };
        observe(mode, &model, channel_type, is_stream, started_at, &status);
        result
    }

    /// Validation and pricing. Nothing here touches the ledger or the network.
    fn prepare(
        &self,
        caller: Caller,
        meta: RequestMeta,
        mode: RelayMode,
        body: &Bytes,
        started_at: Instant,
    ) -> Result<Prepared, RelayError> {
        let mut request = validate::parse_request(body)?;
        validate::validate_request(mode, &mut request, self.settings.relay.max_tokens_ceiling)?;

        let origin_model = request.model.clone();
        let channel = self.channels.select(&origin_model, &caller.group)?;
        let upstream_model = channel.upstream_model(&origin_model);

        if let Some(policy) = &self.policy {
            let words = policy.check(&content_policy::request_text(&request));
            if !words.is_empty() {
                tracing::info!(words = ?words, "Request rejected by content policy");
                return Err(RelayError::PolicyViolation { words });
            }
        }

        let search_context_size = request
            .web_search_options
            .as_ref()
            .and_then(|options| options.search_context_size.clone());
        let quote = self.pricing.snapshot().quote(
            &origin_model,
            &caller.group,
            search_context_size.as_deref(),
        )?;

        let estimated_prompt_tokens =
            tokenizer::count_request_tokens(self.counter.as_ref(), mode, &request, &upstream_model);
        let max_tokens = request
            .max_output()
            .map_or(0, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let estimate = estimate_quota(
            &quote,
            estimated_prompt_tokens,
            max_tokens,
            self.settings.relay.pre_consumed_floor_tokens,
        );

        let adaptor = self
            .adaptors
            .resolve(channel.api_type)
            .ok_or(RelayError::AdaptorNotFound(channel.api_type))?;

        let is_stream = request.is_stream();
        Ok(Prepared {
            call: RelayCall {
                mode,
                caller,
                meta,
                channel,
                request,
                origin_model,
                upstream_model,
                is_stream,
                estimated_prompt_tokens,
                search_context_size,
                started_at,
                started_at_utc: Utc::now(),
            },
            quote,
            estimate,
            adaptor,
        })
    }

    async fn execute(&self, prepared: Prepared, body: Bytes) -> Result<Response, RelayError> {
        let Prepared {
            call,
            quote,
            estimate,
            adaptor,
        } = prepared;

        let hold = self.settler.quota.pre_authorize(&call.caller, estimate).await?;

        let raw = match self.dispatch(adaptor.as_ref(), &call, body).await {
            Ok(raw) => raw,
            Err(e) => {
                self.release(hold, &call, &e);
                return Err(e);
            }
        };

        if raw.is_event_stream() || call.is_stream {
            return Ok(self.stream_response(call, quote, hold, raw));
        }

        let parsed = adaptor.parse_response(&self.context(&call), raw).await;
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                let e = RelayError::from(e);
                self.release(hold, &call, &e);
                return Err(e);
            }
        };

        let usage = self.buffered_usage(&call, parsed.usage, &parsed.payload);
        let settlement = Settlement {
            usage,
            tools: parsed.tools,
            claude_web_search_requests: parsed.server_web_search_requests,
            response: parsed.payload,
        };
        self.settler.settle(&call, &quote, &hold, settlement).await;

        Ok((
            parsed.status,
            [(CONTENT_TYPE, "application/json")],
            parsed.body,
        )
            .into_response())
    }

    fn context<'a>(&self, call: &'a RelayCall) -> AdaptorContext<'a> {
        AdaptorContext {
            mode: call.mode,
            channel: &call.channel,
            upstream_model: &call.upstream_model,
            is_stream: call.is_stream,
            max_response_body_bytes: self.settings.max_response_body_bytes,
        }
    }

    async fn dispatch(
        &self,
        adaptor: &dyn Adaptor,
        call: &RelayCall,
        body: Bytes,
    ) -> Result<RawResponse, RelayError> {
        let ctx = self.context(call);
        let target = adaptor.init(&ctx)?;

        let payload = if self.settings.relay.pass_through_request_body {
            body
        } else {
            let mut translated = adaptor.translate_request(&ctx, &call.request)?;
            apply_param_override(&mut translated, &call.channel.param_override);
            Bytes::from(translated.to_string())
        };

        tracing::debug!(
            adaptor = adaptor.name(),
            url = %target.url,
            upstream_model = %call.upstream_model,
            "Dispatching upstream request"
        );
        let raw = adaptor.dispatch(&self.http, &target, payload).await?;
        if raw.status.is_success() {
            return Ok(raw);
        }

        let status = raw.status;
        let headers = raw.headers.clone();
        let body = raw
            .collect(self.settings.max_response_body_bytes)
            .await
            .unwrap_or_default();
        let err = adaptor.parse_error(status, &headers, &body);
        Err(remap_upstream_status(err.into(), &call.channel))
    }

    fn stream_response(
        &self,
        call: RelayCall,
        quote: PriceQuote,
        hold: Hold,
        raw: RawResponse,
    ) -> Response {
        let status = raw.status;
        let upstream: ByteStream = Box::pin(IdleTimeoutStream::new(
            raw.body,
            self.settings.streaming_idle_timeout,
        ));
        let upstream_model = call.upstream_model.clone();
        let estimated_prompt_tokens = call.estimated_prompt_tokens;

        let settler = self.settler.clone();
        let on_end: OnStreamEnd = Box::new(move |outcome: StreamOutcome| {
            async move {
                tracing::debug!(
                    request_id = %call.request_id(),
                    end = outcome.end.as_str(),
                    usage_reported = outcome.usage_reported,
                    events = outcome.events,
                    "Settling stream"
                );
                let settlement = Settlement {
                    usage: outcome.usage,
                    tools: outcome.tools,
                    claude_web_search_requests: 0,
                    response: ResponsePayload::Text {
                        content: outcome.text,
                        finish_reason: outcome.finish_reason,
                        choices: Value::Null,
                    },
                };
                settler.settle(&call, &quote, &hold, settlement).await;
            }
            .boxed()
        });

        let stream = UsageTrackingStream::new(
            upstream,
            Arc::clone(&self.counter),
            upstream_model,
            estimated_prompt_tokens,
            self.settlements.clone(),
            on_end,
        );

        (
            status,
            [
                (CONTENT_TYPE, "text/event-stream"),
                (CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response()
    }

    /// Upstream usage, or a local count when the upstream reported none.
    fn buffered_usage(
        &self,
        call: &RelayCall,
        reported: Option<Usage>,
        payload: &ResponsePayload,
    ) -> Usage {
        let mut usage =
            reported.unwrap_or_else(|| Usage::prompt_only(call.estimated_prompt_tokens));
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = call.estimated_prompt_tokens;
        }
        if usage.completion_tokens == 0
            && let ResponsePayload::Text { content, .. } = payload
            && !content.is_empty()
        {
            usage.completion_tokens =
                i64::from(self.counter.count_text(content, &call.upstream_model));
        }
        usage.normalize();
        usage
    }

    fn release(&self, hold: Hold, call: &RelayCall, cause: &RelayError) {
        tracing::warn!(
            error = %cause,
            hold = hold.amount,
            "Relay failed after pre-authorization, releasing hold"
        );
        self.settler.jobs.release_hold(
            self.settler.quota.clone(),
            hold,
            call.meta.request_id.clone(),
        );
    }
}

/// Overwrite top-level fields of a translated request.
fn apply_param_override(body: &mut Value, overrides: &Map<String, Value>) {
    if overrides.is_empty() {
        return;
    }
    if let Value::Object(fields) = body {
        for (key, value) in overrides {
            fields.insert(key.clone(), value.clone());
        }
    }
}

fn remap_upstream_status(err: RelayError, channel: &ChannelConfig) -> RelayError {
    match err {
        RelayError::Upstream {
            status,
            code,
            message,
            error_type,
        } => RelayError::Upstream {
            status: channel.remap_status(status),
            code,
            message,
            error_type,
        },
        other => other,
    }
}

fn observe(
    mode: RelayMode,
    model: &str,
    channel_type: &str,
    is_stream: bool,
    started_at: Instant,
    status: &Result<u16, u16>,
) {
    let (outcome, status_code) = match status {
        Ok(code) => ("success", *code),
        Err(code) => ("error", *code),
    };
    let duration_secs = started_at.elapsed().as_secs_f64();
    metrics::record_relay_request(RelayRequestMetrics {
        mode: mode.request_type(),
        model,
        channel_type,
        status: outcome,
        status_code,
        is_stream,
        duration_secs,
    });
    tracing::info!(
        status = status_code,
        outcome,
        is_stream,
        duration_ms = (duration_secs * 1000.0) as u64,
        "Relay request finished"
    );
}
