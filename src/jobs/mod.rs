//! Background jobs for the relay.
//!
//! Settlement hands two kinds of work off the request path:
//!
//! - **Hold release**: a call that failed after its hold was placed gets the
//!   reserved quota back.
//! - **Chat log**: a settled call is written to the chat interaction log.
//!
//! Jobs go through a bounded queue drained by a fixed pool of workers on the
//! shared [`TaskTracker`], so graceful shutdown waits for them. When the queue
//! is full a chat log job is dropped and counted; a hold release is spawned
//! directly on the tracker instead, since dropping it would lose quota.
//!
//! # Example
//!
//! ```toml
//! [jobs]
//! capacity = 10000
//! workers = 2
//! ```

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    chat_log::{ChatInteraction, ChatLogger},
    config::JobQueueConfig,
    observability::metrics,
    relay::quota::{Hold, QuotaService},
};

pub enum Job {
    ReleaseHold {
        quota: QuotaService,
        hold: Hold,
        request_id: String,
    },
    ChatLog(Box<ChatInteraction>),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::ReleaseHold { .. } => "release_hold",
            Job::ChatLog(_) => "chat_log",
        }
    }
}

/// Handle for submitting jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    chat_logger: Option<ChatLogger>,
}

impl JobQueue {
    /// Create the queue and spawn its workers on `tracker`.
    ///
    /// Chat log jobs are ignored when `chat_logger` is `None`.
    pub fn start(
        config: &JobQueueConfig,
        chat_logger: Option<ChatLogger>,
        tracker: &TaskTracker,
    ) -> Self {
        let (queue, receiver) = Self::channel(config.capacity, chat_logger, tracker);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = config.workers.max(1);

        tracing::info!(
            capacity = config.capacity,
            workers,
            chat_log = queue.chat_logger.is_some(),
            "Starting background job workers"
        );

        for worker in 0..workers {
            tracker.spawn(run_worker(
                worker,
                Arc::clone(&receiver),
                queue.chat_logger.clone(),
                queue.shutdown.clone(),
            ));
        }
        queue
    }

    fn channel(
        capacity: usize,
        chat_logger: Option<ChatLogger>,
        tracker: &TaskTracker,
    ) -> (Self, mpsc::Receiver<Job>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = Self {
            sender,
            tracker: tracker.clone(),
            shutdown: CancellationToken::new(),
            chat_logger,
        };
        (queue, receiver)
    }

    /// Give a hold back. Never dropped: falls back to a tracked task when the
    /// queue is full or closed.
    pub fn release_hold(&self, quota: QuotaService, hold: Hold, request_id: String) {
        if hold.amount == 0 {
            return;
        }
        let job = Job::ReleaseHold {
            quota,
            hold,
            request_id,
        };
        match self.sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                tracing::warn!("Job queue unavailable, releasing hold on a dedicated task");
                self.tracker.spawn(execute(job, None));
            }
        }
    }

    /// Queue a chat log write. Dropped with a warning when the queue is full
    /// or its workers have already exited.
    pub fn record_chat(&self, interaction: ChatInteraction) {
        if self.chat_logger.is_none() {
            return;
        }
        let Err(err) = self.sender.try_send(Job::ChatLog(Box::new(interaction))) else {
            return;
        };
        let state = rejection(&err);
        let (TrySendError::Full(job) | TrySendError::Closed(job)) = err;
        metrics::record_job_dropped(job.kind());
        if let Job::ChatLog(interaction) = job {
            tracing::warn!(
                request_id = %interaction.request_id,
                queue = state,
                "Job queue {state}, dropping chat log entry"
            );
        }
    }

    /// Ask workers to drain what is queued and exit.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Why the queue refused a job.
fn rejection(err: &TrySendError<Job>) -> &'static str {
    match err {
        TrySendError::Full(_) => "full",
        TrySendError::Closed(_) => "closed",
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    chat_logger: Option<ChatLogger>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                job = receiver.recv() => job,
                _ = shutdown.cancelled() => receiver.try_recv().ok(),
            }
        };
        match job {
            Some(job) => execute(job, chat_logger.as_ref()).await,
            None => break,
        }
    }
    tracing::debug!(worker, "Background job worker stopped");
}

async fn execute(job: Job, chat_logger: Option<&ChatLogger>) {
    match job {
        Job::ReleaseHold {
            quota,
            hold,
            request_id,
        } => {
            if let Err(e) = quota.release(&hold).await {
                tracing::error!(
                    error = %e,
                    %request_id,
                    user_id = hold.user_id,
                    token_id = hold.token_id,
                    amount = hold.amount,
                    charge_token = hold.charge_token,
                    "Failed to release hold; manual reconciliation required"
                );
            } else {
                tracing::debug!(%request_id, amount = hold.amount, "Released hold");
            }
        }
        Job::ChatLog(interaction) => {
            let Some(logger) = chat_logger else {
                return;
            };
            let request_id = interaction.request_id.clone();
            if let Err(e) = logger.record(*interaction).await {
                tracing::warn!(error = %e, %request_id, "Failed to write chat log");
            }
        }
    }
}
