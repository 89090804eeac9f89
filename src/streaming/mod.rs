use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures_util::stream::Stream;
use serde_json::Value;
use tokio::time::Sleep;
use tokio_util::task::TaskTracker;

use crate::{
    api_types::{FILE_SEARCH, ToolUsage, Usage, WEB_SEARCH_PREVIEW},
    observability::metrics,
    providers::{ByteStream, ProviderError},
    tokenizer::TokenCounter,
};

// ============================================================================
// Idle Timeout Stream
// ============================================================================

/// Error returned when a streaming response times out.
#[derive(Debug, thiserror::Error)]
#[error("streaming idle timeout: no chunk received within {0:?}")]
pub struct IdleTimeoutError(Duration);

impl From<IdleTimeoutError> for ProviderError {
    fn from(err: IdleTimeoutError) -> Self {
        ProviderError::Transport {
            message: err.to_string(),
            timed_out: true,
        }
    }
}

/// A stream wrapper that enforces an idle timeout between chunks.
///
/// If no chunk is yielded from the inner stream within the specified timeout,
/// the stream returns an error and terminates. The timeout resets after each
/// chunk, so long-running streams that keep producing data never time out.
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    terminated: bool,
}

impl<S> IdleTimeoutStream<S>
where
    S: Stream + Unpin,
{
    /// If `timeout` is zero, the wrapper is a pass-through.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            terminated: false,
        }
    }

    fn timeout_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }
}

impl<S, T, E> Stream for IdleTimeoutStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: From<IdleTimeoutError>,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }

        if !self.timeout_enabled() {
            return Pin::new(&mut self.inner).poll_next(cx);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                let new_deadline = tokio::time::Instant::now() + self.timeout;
                self.sleep.as_mut().reset(new_deadline);
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.terminated = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => match self.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.terminated = true;
                    tracing::warn!(
                        timeout_secs = self.timeout.as_secs(),
                        "Streaming response idle timeout - terminating stalled stream"
                    );
                    metrics::record_gateway_error("streaming", "idle_timeout");
                    Poll::Ready(Some(Err(IdleTimeoutError(self.timeout).into())))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

// ============================================================================
// SSE folding
// ============================================================================

/// Built-in tool name for a Responses API output item type.
pub fn builtin_tool_for_item(item_type: &str) -> Option<&'static str> {
    match item_type {
        "web_search_call" => Some(WEB_SEARCH_PREVIEW),
        "file_search_call" => Some(FILE_SEARCH),
        _ => None,
    }
}

/// Folds SSE events into usage, reply text and tool counts.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; incomplete lines are
/// held until the rest arrives.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    pending: Vec<u8>,
    reported: Option<Usage>,
    text: String,
    finish_reason: Option<String>,
    tools: ToolUsage,
    events: u64,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.process_line(&line);
        }
    }

    fn process_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let Some(data) = line.trim_end().strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            tracing::debug!(line = data, "Skipping unparseable SSE data line");
            return;
        };
        self.events += 1;
        self.fold(&event);
    }

    fn fold(&mut self, event: &Value) {
        match event.get("type").and_then(Value::as_str) {
            Some("response.completed") => {
                let response = event.get("response");
                if let Some(usage) = response.and_then(|r| r.get("usage")) {
                    self.adopt_usage(usage);
                }
                if let Some(status) = response
                    .and_then(|r| r.get("status"))
                    .and_then(Value::as_str)
                {
                    self.finish_reason = Some(match status {
                        "completed" => "stop".to_string(),
                        other => other.to_string(),
                    });
                }
            }
            Some("response.output_text.delta") => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    self.text.push_str(delta);
                }
            }
            Some("response.output_item.done") => {
                if let Some(tool) = event
                    .pointer("/item/type")
                    .and_then(Value::as_str)
                    .and_then(builtin_tool_for_item)
                {
                    self.tools.increment(tool);
                }
            }
            Some(_) => {}
            None => self.fold_chat_chunk(event),
        }
    }

    fn fold_chat_chunk(&mut self, chunk: &Value) {
        if let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        {
            if let Some(content) = choice
                .pointer("/delta/content")
                .or_else(|| choice.get("text"))
                .and_then(Value::as_str)
            {
                self.text.push_str(content);
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }
        if let Some(usage) = chunk.get("usage")
            && !usage.is_null()
        {
            self.adopt_usage(usage);
        }
    }

    fn adopt_usage(&mut self, raw: &Value) {
        match serde_json::from_value::<Usage>(raw.clone()) {
            Ok(usage) => self.reported = Some(usage),
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed usage in stream"),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reported_usage(&self) -> Option<&Usage> {
        self.reported.as_ref()
    }

    /// Close out the stream.
    ///
    /// A final line with no trailing newline is still folded. Counts the
    /// upstream did not report are filled in: the prompt from the
    /// pre-dispatch estimate, the completion by tokenizing the reply text.
    pub fn finish(
        mut self,
        counter: &dyn TokenCounter,
        upstream_model: &str,
        estimated_prompt_tokens: i64,
        end: StreamEnd,
    ) -> StreamOutcome {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.process_line(&line);
        }

        let usage_reported = self.reported.is_some();
        let mut usage = match self.reported {
            Some(usage) => usage,
            None => Usage::prompt_only(estimated_prompt_tokens),
        };
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = estimated_prompt_tokens;
        }
        if usage.completion_tokens == 0 && !self.text.is_empty() {
            usage.completion_tokens = i64::from(counter.count_text(&self.text, upstream_model));
        }
        usage.normalize();

        StreamOutcome {
            usage,
            usage_reported,
            text: self.text,
            finish_reason: self.finish_reason,
            tools: self.tools,
            events: self.events,
            end,
        }
    }
}

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Error,
    /// Dropped before the end, usually a client disconnect.
    Dropped,
}

impl StreamEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEnd::Completed => "completed",
            StreamEnd::Error => "error",
            StreamEnd::Dropped => "dropped",
        }
    }
}

/// Everything observed on a finished stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: Usage,
    /// Whether the upstream sent usage itself.
    pub usage_reported: bool,
    pub text: String,
    pub finish_reason: Option<String>,
    pub tools: ToolUsage,
    pub events: u64,
    pub end: StreamEnd,
}

/// Callback run once when a tracked stream ends.
pub type OnStreamEnd = Box<dyn FnOnce(StreamOutcome) -> BoxFuture<'static, ()> + Send>;

/// Forwards upstream chunks verbatim while folding them into usage.
///
/// The end-of-stream callback runs exactly once, on the first of: normal end,
/// stream error, or drop (client disconnect). It runs on the task tracker so
/// graceful shutdown waits for it.
pub struct UsageTrackingStream {
    inner: ByteStream,
    accumulator: SseAccumulator,
    on_end: Option<OnStreamEnd>,
    counter: Arc<dyn TokenCounter>,
    upstream_model: String,
    estimated_prompt_tokens: i64,
    task_tracker: TaskTracker,
}

impl UsageTrackingStream {
    pub fn new(
        inner: ByteStream,
        counter: Arc<dyn TokenCounter>,
        upstream_model: impl Into<String>,
        estimated_prompt_tokens: i64,
        task_tracker: TaskTracker,
        on_end: OnStreamEnd,
    ) -> Self {
        Self {
            inner,
            accumulator: SseAccumulator::new(),
            on_end: Some(on_end),
            counter,
            upstream_model: upstream_model.into(),
            estimated_prompt_tokens,
            task_tracker,
        }
    }

    fn complete(&mut self, end: StreamEnd) {
        let Some(on_end) = self.on_end.take() else {
            return;
        };
        let accumulator = std::mem::take(&mut self.accumulator);
        let counter = Arc::clone(&self.counter);
        let model = std::mem::take(&mut self.upstream_model);
        let estimate = self.estimated_prompt_tokens;

        metrics::record_stream_end(end.as_str());
        if end != StreamEnd::Completed {
            tracing::warn!(
                end = end.as_str(),
                "Stream ended early - settling partial usage"
            );
        }

        self.task_tracker.spawn(async move {
            let outcome = accumulator.finish(counter.as_ref(), &model, estimate, end);
            on_end(outcome).await;
        });
    }
}

impl Stream for UsageTrackingStream {
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.on_end.is_none() {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.accumulator.feed(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "Upstream stream failed");
                self.complete(StreamEnd::Error);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.complete(StreamEnd::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for UsageTrackingStream {
    fn drop(&mut self) {
        self.complete(StreamEnd::Dropped);
    }
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, StreamExt};
    use tokio::sync::oneshot;

    use super::*;
    use crate::tokenizer::HeuristicCounter;

    fn feed_all(chunks: &[&str]) -> SseAccumulator {
        let mut acc = SseAccumulator::new();
        for chunk in chunks {
            acc.feed(chunk.as_bytes());
        }
        acc
    }

    #[test]
    fn test_responses_completed_overrides_estimate() {
        let acc = feed_all(&[
            "event: response.output_text.delta\ndata: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"status\":\"completed\",\"usage\":{\"input_tokens\":7,\"output_tokens\":42,\"total_tokens\":49}}}\n\n",
        ]);
        let outcome = acc.finish(&HeuristicCounter, "gpt-4o", 100, StreamEnd::Completed);

        assert!(outcome.usage_reported);
        assert_eq!(outcome.usage.prompt_tokens, 7);
        assert_eq!(outcome.usage.completion_tokens, 42);
        assert_eq!(outcome.usage.total_tokens, 49);
        assert_eq!(outcome.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_fallback_tokenizes_concatenated_deltas() {
        let acc = feed_all(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"abcd\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"efgh\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ij\"},\"finish_reason\":\"length\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert_eq!(acc.text(), "abcdefghij");

        let outcome = acc.finish(&HeuristicCounter, "gpt-4o", 12, StreamEnd::Completed);
        assert!(!outcome.usage_reported);
        assert_eq!(outcome.usage.prompt_tokens, 12);
        assert_eq!(
            outcome.usage.completion_tokens,
            i64::from(HeuristicCounter.count_text("abcdefghij", "gpt-4o"))
        );
        assert_eq!(
            outcome.usage.total_tokens,
            outcome.usage.prompt_tokens + outcome.usage.completion_tokens
        );
        assert_eq!(outcome.finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let acc = feed_all(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hé",
            "llo\"}}]}\n",
            "\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}",
            "\n\n",
        ]);
        assert_eq!(acc.text(), "Héllo");
        assert_eq!(acc.reported_usage().unwrap().completion_tokens, 2);
    }

    #[test]
    fn test_unterminated_final_usage_line_is_folded() {
        let acc = feed_all(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":31}}",
        ]);
        assert!(acc.reported_usage().is_none());

        let outcome = acc.finish(&HeuristicCounter, "gpt-4o", 100, StreamEnd::Completed);
        assert!(outcome.usage_reported);
        assert_eq!(outcome.usage.prompt_tokens, 9);
        assert_eq!(outcome.usage.completion_tokens, 31);
        assert_eq!(outcome.usage.total_tokens, 40);
        assert_eq!(outcome.events, 2);
    }

    #[test]
    fn test_utf8_split_inside_character() {
        let bytes = "data: {\"choices\":[{\"delta\":{\"content\":\"日本\"}}]}\n\n".as_bytes();
        let mut acc = SseAccumulator::new();
        // Split in the middle of a multi-byte character.
        let split = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
        acc.feed(&bytes[..split]);
        acc.feed(&bytes[split..]);
        assert_eq!(acc.text(), "日本");
    }

    #[test]
    fn test_builtin_tool_items_counted() {
        let acc = feed_all(&[
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"web_search_call\"}}\n\n",
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"web_search_call\"}}\n\n",
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"file_search_call\"}}\n\n",
            "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"message\"}}\n\n",
        ]);
        let outcome = acc.finish(&HeuristicCounter, "gpt-4o", 0, StreamEnd::Completed);
        assert_eq!(outcome.tools.count(WEB_SEARCH_PREVIEW), 2);
        assert_eq!(outcome.tools.count(FILE_SEARCH), 1);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let acc = feed_all(&[": keep-alive\n\n", "data: not json\n\n", "event: ping\n\n"]);
        assert_eq!(acc.events, 0);
        assert!(acc.reported_usage().is_none());
    }

    fn byte_stream(chunks: Vec<Result<&'static str, ProviderError>>) -> ByteStream {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes()))),
        )
        .boxed()
    }

    fn tracked(
        inner: ByteStream,
        tracker: &TaskTracker,
    ) -> (UsageTrackingStream, oneshot::Receiver<StreamOutcome>) {
        let (tx, rx) = oneshot::channel();
        let stream = UsageTrackingStream::new(
            inner,
            Arc::new(HeuristicCounter),
            "gpt-4o",
            5,
            tracker.clone(),
            Box::new(move |outcome| {
                async move {
                    let _ = tx.send(outcome);
                }
                .boxed()
            }),
        );
        (stream, rx)
    }

    #[tokio::test]
    async fn test_tracking_stream_forwards_chunks_verbatim() {
        let tracker = TaskTracker::new();
        let chunks = vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"),
            Ok("data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":42}}\n\n"),
            Ok("data: [DONE]\n\n"),
        ];
        let expected: Vec<u8> = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().as_bytes())
            .collect::<Vec<_>>()
            .concat();
        let (stream, rx) = tracked(byte_stream(chunks), &tracker);

        let forwarded: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(forwarded.concat(), expected);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.end, StreamEnd::Completed);
        assert_eq!(outcome.usage.completion_tokens, 42);
        assert_eq!(outcome.text, "hi");
    }

    #[tokio::test]
    async fn test_tracking_stream_settles_once_on_error() {
        let tracker = TaskTracker::new();
        let chunks = vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"abcdefgh\"}}]}\n\n"),
            Err(ProviderError::Transport {
                message: "reset".into(),
                timed_out: false,
            }),
        ];
        let (mut stream, rx) = tracked(byte_stream(chunks), &tracker);

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        drop(stream);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.end, StreamEnd::Error);
        assert_eq!(outcome.usage.prompt_tokens, 5);
        assert_eq!(outcome.usage.completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_tracking_stream_settles_on_drop() {
        let tracker = TaskTracker::new();
        let chunks = vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n"),
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\" more\"}}]}\n\n"),
        ];
        let (mut stream, rx) = tracked(byte_stream(chunks), &tracker);

        stream.next().await.unwrap().unwrap();
        drop(stream);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.end, StreamEnd::Dropped);
        assert_eq!(outcome.text, "partial");
        assert!(outcome.usage.completion_tokens > 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_terminates_stalled_stream() {
        let stalled = futures::stream::pending::<Result<Bytes, ProviderError>>();
        let mut stream = IdleTimeoutStream::new(Box::pin(stalled), Duration::from_millis(20));

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.timed_out());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout_zero_is_passthrough() {
        let inner = tokio_stream::iter(vec![Ok::<_, ProviderError>(Bytes::from_static(b"a"))]);
        let items: Vec<_> = IdleTimeoutStream::new(inner, Duration::ZERO).collect().await;
        assert_eq!(items.len(), 1);
    }
}
