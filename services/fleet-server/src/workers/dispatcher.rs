//! Worker dispatcher.
//!
//! Spawns `concurrency[queue]` consumers for every configured queue that has
//! a registered handler. Each consumer blocks on the queue, runs the handler
//! behind panic isolation, reports failures, and hands failed envelopes to
//! the queue's own redelivery, which delays each retry with backoff. No retry
//! bookkeeping lives here.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use fleet_events::RawEnvelope;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::{HandlerError, JobHandler, JobRegistry};
use crate::db::QueueStore;
use crate::notify::{ErrorReporter, JobContext};

/// How long a consumer blocks on an empty queue before checking for shutdown.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a store error before polling again.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One consumer bound to one queue.
#[derive(Clone)]
pub struct Consumer {
    queue_name: String,
    queue: QueueStore,
    handler: Arc<dyn JobHandler>,
    reporter: Arc<dyn ErrorReporter>,
    poll_timeout: Duration,
}

impl Consumer {
    pub fn new(
        queue_name: impl Into<String>,
        queue: QueueStore,
        handler: Arc<dyn JobHandler>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue,
            handler,
            reporter,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consumes jobs until shutdown is signaled. Shutdown is observed between
    /// jobs; a job in flight runs to completion.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        debug!(queue = %self.queue_name, "Consumer started");
        while !*shutdown.borrow() {
            match self.queue.dequeue_payload(&self.queue_name, self.poll_timeout).await {
                Ok(Some(payload)) => self.process(&payload).await,
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(STORE_ERROR_BACKOFF).await;
                }
            }
        }
        debug!(queue = %self.queue_name, "Consumer stopped");
    }

    /// Pops and processes at most one job. Returns whether a job was found.
    pub async fn run_once(&self) -> Result<bool, crate::db::StoreError> {
        match self
            .queue
            .dequeue_payload(&self.queue_name, self.poll_timeout)
            .await?
        {
            Some(payload) => {
                self.process(&payload).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs one payload through the handler middleware.
    pub async fn process(&self, payload: &str) {
        let envelope = match RawEnvelope::from_payload(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Nothing to redeliver: the payload itself is unreadable.
                let context = JobContext {
                    queue: self.queue_name.clone(),
                    class: String::new(),
                    job_id: String::new(),
                    retry_count: 0,
                };
                self.reporter.report(&context, &HandlerError::Decode(e));
                return;
            }
        };

        let outcome = AssertUnwindSafe(self.handler.handle(&envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => {
                debug!(
                    queue = %self.queue_name,
                    class = %envelope.class,
                    job_id = %envelope.job_id,
                    "Job complete"
                );
            }
            Err(e) => self.fail(&envelope, e).await,
        }
    }

    async fn fail(&self, envelope: &RawEnvelope, err: HandlerError) {
        let context = JobContext {
            queue: self.queue_name.clone(),
            class: envelope.class.clone(),
            job_id: envelope.job_id.clone(),
            retry_count: envelope.retry_count,
        };
        self.reporter.report(&context, &err);

        match self.queue.requeue(envelope).await {
            Ok(Some(due)) => debug!(job_id = %envelope.job_id, retry_at = %due, "Job requeued"),
            Ok(None) => {}
            Err(e) => error!(
                job_id = %envelope.job_id,
                error = %e,
                "Failed to requeue job"
            ),
        }
    }
}

/// Consumer pools for every served queue.
pub struct WorkerDispatcher {
    queue: QueueStore,
    registry: JobRegistry,
    concurrency: BTreeMap<String, usize>,
    reporter: Arc<dyn ErrorReporter>,
    poll_timeout: Duration,
}

impl WorkerDispatcher {
    /// Create a dispatcher. `concurrency` names the queues to serve and
    /// how many consumers each gets.
    pub fn new(
        queue: QueueStore,
        registry: JobRegistry,
        concurrency: BTreeMap<String, usize>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            queue,
            registry,
            concurrency,
            reporter,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consumers this dispatcher would start, one entry per consumer.
    pub fn consumers(&self) -> Vec<Consumer> {
        let mut consumers = Vec::new();
        for (queue_name, &count) in &self.concurrency {
            let Some(handler) = self.registry.get(queue_name) else {
                warn!(queue = %queue_name, "No handler registered for queue, skipping");
                continue;
            };
            for _ in 0..count {
                consumers.push(
                    Consumer::new(
                        queue_name.clone(),
                        self.queue.clone(),
                        handler.clone(),
                        self.reporter.clone(),
                    )
                    .with_poll_timeout(self.poll_timeout),
                );
            }
        }
        consumers
    }

    /// Run every consumer until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let consumers = self.consumers();
        info!(
            queues = self.concurrency.len(),
            consumers = consumers.len(),
            "Starting worker dispatcher"
        );

        let mut tasks = JoinSet::new();
        for consumer in consumers {
            tasks.spawn(consumer.run(shutdown.clone()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Consumer task failed");
            }
        }

        info!("Worker dispatcher shut down");
    }
}
