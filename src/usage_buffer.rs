//! Batched consume log writes.
//!
//! Settlement pushes one [`ConsumeLogEntry`] per call. Pushing never blocks the
//! request path: entries go into a lock-free crossbeam channel and a background
//! worker writes them to the [`ConsumeLogRepo`] in batches.
//!
//! The buffer flushes when:
//! - a batch reaches `max_size` entries
//! - the `flush_interval` timer expires
//! - `shutdown()` is called (the worker drains everything before exiting)

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio_util::task::TaskTracker;

use crate::{db::ConsumeLogRepo, models::ConsumeLogEntry, observability::metrics};

/// Runtime settings for the consume log buffer.
#[derive(Debug, Clone)]
pub struct ConsumeBufferConfig {
    /// Maximum number of entries written per batch.
    pub max_size: usize,
    pub flush_interval: Duration,
    /// Pending entries beyond this are dropped.
    pub max_pending_entries: usize,
}

impl Default for ConsumeBufferConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            flush_interval: Duration::from_secs(1),
            max_pending_entries: 10_000,
        }
    }
}

impl From<&crate::config::UsageBufferConfig> for ConsumeBufferConfig {
    fn from(config: &crate::config::UsageBufferConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_pending_entries: config.max_pending_entries,
        }
    }
}

pub struct ConsumeLogBuffer {
    sender: Sender<ConsumeLogEntry>,
    receiver: Receiver<ConsumeLogEntry>,
    config: ConsumeBufferConfig,
    shutdown: AtomicBool,
    dropped_count: AtomicU64,
}

impl ConsumeLogBuffer {
    pub fn new(config: ConsumeBufferConfig) -> Self {
        // Unbounded is risky; use a large but bounded capacity
        let capacity = if config.max_pending_entries > 0 {
            config.max_pending_entries
        } else {
            1_000_000
        };
        let (sender, receiver) = crossbeam_channel::bounded(capacity);

        Self {
            sender,
            receiver,
            config,
            shutdown: AtomicBool::new(false),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Queue an entry. Lock-free; drops the entry if the buffer is full.
    pub fn push(&self, entry: ConsumeLogEntry) {
        match self.sender.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                metrics::record_job_dropped("consume_log");
                let count = self.dropped_count.fetch_add(1, Ordering::Relaxed);
                // Every 100th drop, to avoid log spam.
                if count.is_multiple_of(100) {
                    tracing::warn!(
                        dropped_count = count + 1,
                        max_pending = self.config.max_pending_entries,
                        request_id = %entry.request_id,
                        "Consume log buffer overflow: dropping entries"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Start the flush worker on the task tracker. It runs until `shutdown()`.
    pub fn start_worker(self: &Arc<Self>, sink: Arc<dyn ConsumeLogRepo>, tracker: &TaskTracker) {
        let buffer = Arc::clone(self);
        let flush_interval = self.config.flush_interval;
        let max_batch_size = self.config.max_size;

        tracker.spawn(async move {
            let mut batch = Vec::with_capacity(max_batch_size);

            loop {
                buffer.drain_entries(&mut batch, max_batch_size);
                if !batch.is_empty() {
                    buffer.flush_batch(&sink, &mut batch).await;
                    // A full batch means more may be waiting.
                    if buffer.receiver.len() >= max_batch_size {
                        continue;
                    }
                }

                if buffer.shutdown.load(Ordering::Acquire) {
                    buffer.drain_all(&mut batch);
                    if !batch.is_empty() {
                        buffer.flush_batch(&sink, &mut batch).await;
                    }
                    tracing::info!("Consume log buffer worker shutting down");
                    break;
                }

                tokio::time::sleep(flush_interval).await;
            }
        });
    }

    fn drain_entries(&self, batch: &mut Vec<ConsumeLogEntry>, max_size: usize) {
        while batch.len() < max_size {
            match self.receiver.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }
    }

    fn drain_all(&self, batch: &mut Vec<ConsumeLogEntry>) {
        while let Ok(entry) = self.receiver.try_recv() {
            batch.push(entry);
        }
    }

    /// Signal the worker to flush what is left and stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    async fn flush_batch(&self, sink: &Arc<dyn ConsumeLogRepo>, batch: &mut Vec<ConsumeLogEntry>) {
        let entry_count = batch.len();
        tracing::debug!(count = entry_count, "Flushing consume log buffer");

        match sink.log_batch(std::mem::take(batch)).await {
            Ok(written) => {
                tracing::debug!(written, total = entry_count, "Consume log flush successful");
            }
            Err(e) => {
                tracing::error!(error = %e, count = entry_count, "Consume log flush failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
