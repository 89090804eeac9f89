//! Prometheus metrics for the gateway.
//!
//! Provides metrics for:
//! - relay request counts and latency per mode and channel
//! - token usage and settled quota
//! - stream lifecycles and background job drops

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &seconds_from_ms(&config.latency_buckets_ms),
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Install the Prometheus recorder (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

#[cfg(feature = "prometheus")]
fn seconds_from_ms(ms_buckets: &[f64]) -> Vec<f64> {
    ms_buckets.iter().map(|ms| ms / 1000.0).collect()
}

/// Render the Prometheus text exposition, if the recorder is installed.
pub fn render() -> Option<String> {
    #[cfg(feature = "prometheus")]
    {
        PROMETHEUS_HANDLE.get().map(|handle| handle.render())
    }
    #[cfg(not(feature = "prometheus"))]
    {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one relay call.
#[derive(Debug, Clone)]
pub struct RelayRequestMetrics<'a> {
    /// Relay mode, e.g. "chat_completions"
    pub mode: &'a str,
    /// Model name as requested by the client
    pub model: &'a str,
    /// Channel api type, e.g. "openai"
    pub channel_type: &'a str,
    /// "success" or "error"
    pub status: &'a str,
    pub status_code: u16,
    pub is_stream: bool,
    pub duration_secs: f64,
}

/// Record a relay request.
pub fn record_relay_request(metrics: RelayRequestMetrics<'_>) {
    #[cfg(feature = "prometheus")]
    {
        let RelayRequestMetrics {
            mode,
            model,
            channel_type,
            status,
            status_code,
            is_stream,
            duration_secs,
        } = metrics;

        counter!(
            "relay_requests_total",
            "mode" => mode.to_string(),
            "model" => model.to_string(),
            "channel_type" => channel_type.to_string(),
            "status" => status.to_string(),
            "status_code" => status_code.to_string(),
            "stream" => is_stream.to_string()
        )
        .increment(1);

        histogram!(
            "relay_request_duration_seconds",
            "mode" => mode.to_string(),
            "channel_type" => channel_type.to_string(),
            "status" => status.to_string()
        )
        .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = metrics;
    }
}

/// Record token usage and the quota charged for a settled call.
pub fn record_quota_settled(model: &str, prompt_tokens: i64, completion_tokens: i64, quota: i64) {
    #[cfg(feature = "prometheus")]
    {
        counter!("relay_prompt_tokens_total", "model" => model.to_string())
            .increment(prompt_tokens.max(0) as u64);
        counter!("relay_completion_tokens_total", "model" => model.to_string())
            .increment(completion_tokens.max(0) as u64);
        counter!("relay_quota_settled_total", "model" => model.to_string())
            .increment(quota.max(0) as u64);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (model, prompt_tokens, completion_tokens, quota);
    }
}

/// Record a gateway-side error, labelled by where it happened.
pub fn record_gateway_error(error_type: &str, error_code: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!(
            "gateway_errors_total",
            "error_type" => error_type.to_string(),
            "error_code" => error_code.to_string()
        )
        .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (error_type, error_code);
    }
}

/// Record how a streamed response ended ("completed", "error" or "dropped").
pub fn record_stream_end(end: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("relay_streams_total", "end" => end.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = end;
    }
}

/// Record a background job that was dropped because its queue was full.
pub fn record_job_dropped(kind: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("background_jobs_dropped_total", "kind" => kind.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = kind;
    }
}

/// Record the result of a chat log write ("inserted", "duplicate" or "failed").
pub fn record_chat_log(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("chat_log_writes_total", "outcome" => outcome.to_string()).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
