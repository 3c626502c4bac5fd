//! Durable job queue.
//!
//! Jobs are JSON envelopes left-pushed onto `queue:<name>` and right-popped
//! by consumers, giving best-effort FIFO per queue. Every queue ever written
//! is recorded in the `queues` registry set in the same transaction as the
//! push. Popping is not transactional with processing: a consumer that dies
//! mid-job loses that job unless the handler's side effects already landed.
//!
//! A failed job waits in `queue_retry:<name>`, a hash of
//! `<due millis>:<nonce>:<job id>` to payload, until its backoff has passed.
//! Each dequeue on the queue first moves due entries back onto the list.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{Job, JobEnvelope, RawEnvelope};
use fleet_reconcile::{Clock, ExponentialBackoff, SystemClock};
use tracing::{debug, warn};

use super::{KvOp, KvStore, StoreError};

/// Registry set of every queue that has been written to.
pub const QUEUES_KEY: &str = "queues";

/// Redeliveries allowed before a failing job is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Key of the list backing `queue`.
pub fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

/// Key of the hash holding `queue`'s pending redeliveries.
pub fn retry_key(queue: &str) -> String {
    format!("queue_retry:{queue}")
}

fn retry_field(due: DateTime<Utc>, job_id: &str) -> String {
    format!(
        "{:013}:{:08x}:{job_id}",
        due.timestamp_millis(),
        rand::random::<u32>()
    )
}

/// Due time of a retry field, in unix millis.
fn field_due(field: &str) -> Option<i64> {
    field.split_once(':')?.0.parse().ok()
}

/// Handle to the durable queue.
#[derive(Clone)]
pub struct QueueStore {
    kv: Arc<dyn KvStore>,
    max_retries: u32,
    backoff: ExponentialBackoff,
    clock: Arc<dyn Clock>,
}

impl QueueStore {
    pub fn new(kv: Arc<dyn KvStore>, max_retries: u32) -> Self {
        Self {
            kv,
            max_retries,
            backoff: ExponentialBackoff::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn push_ops(queue: &str, payload: String) -> Vec<KvOp> {
        vec![
            KvOp::sadd(QUEUES_KEY, queue),
            KvOp::lpush(queue_key(queue), payload),
        ]
    }

    /// Appends a serialized payload to `queue` and registers the queue name,
    /// atomically.
    pub async fn enqueue_payload(&self, queue: &str, payload: String) -> Result<(), StoreError> {
        self.kv.transact(Self::push_ops(queue, payload)).await
    }

    /// Enqueues an envelope on the queue it names.
    pub async fn enqueue<T: serde::Serialize>(
        &self,
        envelope: &JobEnvelope<T>,
    ) -> Result<(), StoreError> {
        let payload = envelope.to_payload()?;
        self.enqueue_payload(&envelope.queue, payload).await?;
        debug!(
            queue = %envelope.queue,
            class = %envelope.class,
            job_id = %envelope.job_id,
            "Enqueued job"
        );
        Ok(())
    }

    /// Wraps `job` in a fresh envelope and enqueues it on its own queue.
    pub async fn push<T: Job>(&self, job: T) -> Result<JobEnvelope<T>, StoreError> {
        self.push_with(job, Vec::new()).await
    }

    /// Enqueues `job` in the same transaction as `writes`. Either the job
    /// and the records it works on all land, or none of them do.
    pub async fn push_with<T: Job>(
        &self,
        job: T,
        writes: Vec<KvOp>,
    ) -> Result<JobEnvelope<T>, StoreError> {
        let envelope = JobEnvelope::for_job(job);
        let mut ops = writes;
        ops.extend(Self::push_ops(&envelope.queue, envelope.to_payload()?));
        self.kv.transact(ops).await?;
        debug!(
            queue = %envelope.queue,
            class = %envelope.class,
            job_id = %envelope.job_id,
            "Enqueued job"
        );
        Ok(envelope)
    }

    /// Pops the oldest payload from `queue`, waiting up to `timeout`. Due
    /// redeliveries are moved onto the queue first.
    pub async fn dequeue_payload(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.promote_due(queue).await?;
        self.kv.brpop(&queue_key(queue), timeout).await
    }

    /// Pops and parses the oldest envelope from `queue`.
    pub async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<RawEnvelope>, StoreError> {
        match self.dequeue_payload(queue, timeout).await? {
            Some(payload) => Ok(Some(RawEnvelope::from_payload(&payload)?)),
            None => Ok(None),
        }
    }

    /// Schedules a failed job for another attempt once its backoff has
    /// passed.
    ///
    /// Returns when the job becomes due, or `None` when it was dropped
    /// because retries are disabled or exhausted.
    pub async fn requeue(
        &self,
        envelope: &RawEnvelope,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if !envelope.retry {
            warn!(
                queue = %envelope.queue,
                class = %envelope.class,
                job_id = %envelope.job_id,
                "Job failed with retries disabled, dropping"
            );
            return Ok(None);
        }

        if envelope.retry_count >= self.max_retries {
            warn!(
                queue = %envelope.queue,
                class = %envelope.class,
                job_id = %envelope.job_id,
                retry_count = envelope.retry_count,
                "Job exhausted retries, dropping"
            );
            return Ok(None);
        }

        let delay = self.backoff.delay(envelope.retry_count);
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| self.clock.now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let redelivery = envelope.redelivery();
        let payload = redelivery.to_payload()?;
        self.kv
            .transact(vec![
                KvOp::sadd(QUEUES_KEY, envelope.queue.as_str()),
                KvOp::hset(
                    retry_key(&envelope.queue),
                    vec![(retry_field(due, &envelope.job_id), payload)],
                ),
            ])
            .await?;

        debug!(
            queue = %envelope.queue,
            job_id = %envelope.job_id,
            retry_count = redelivery.retry_count,
            delay_secs = delay.as_secs(),
            "Job scheduled for redelivery"
        );
        Ok(Some(due))
    }

    /// Moves redeliveries whose backoff has passed back onto `queue`.
    /// Returns how many were moved.
    pub async fn promote_due(&self, queue: &str) -> Result<usize, StoreError> {
        let key = retry_key(queue);
        let waiting = self.kv.hgetall(&key).await?;
        if waiting.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now().timestamp_millis();
        let mut due: Vec<(String, String)> = waiting
            .into_iter()
            .filter(|(field, _)| field_due(field).is_none_or(|at| at <= now))
            .collect();
        due.sort();

        let mut promoted = 0;
        for (field, payload) in due {
            let ops = vec![
                KvOp::hcheck(key.as_str(), field.as_str(), Some(payload.as_str())),
                KvOp::hdel(key.as_str(), field.as_str()),
                KvOp::lpush(queue_key(queue), payload),
            ];
            match self.kv.transact(ops).await {
                Ok(()) => promoted += 1,
                // Another consumer moved it first.
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if promoted > 0 {
            debug!(queue, promoted, "Promoted due redeliveries");
        }
        Ok(promoted)
    }

    /// Number of jobs waiting on `queue`.
    pub async fn depth(&self, queue: &str) -> Result<usize, StoreError> {
        self.kv.llen(&queue_key(queue)).await
    }

    /// Number of failed jobs waiting out their backoff on `queue`.
    pub async fn scheduled(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self.kv.hgetall(&retry_key(queue)).await?.len())
    }

    /// Every queue name that has been written to.
    pub async fn known_queues(&self) -> Result<Vec<String>, StoreError> {
        self.kv.smembers(QUEUES_KEY).await
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use fleet_events::{InstanceLifecycleTransition, Transition};
    use fleet_reconcile::ManualClock;

    const NO_WAIT: Duration = Duration::from_millis(10);
    const Q: &str = InstanceLifecycleTransition::QUEUE;

    fn store(max_retries: u32) -> QueueStore {
        QueueStore::new(Arc::new(MemoryStore::new()), max_retries)
    }

    fn clocked(clock: &Arc<ManualClock>) -> QueueStore {
        QueueStore::new(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            DEFAULT_MAX_RETRIES,
        )
        .with_clock(clock.clone())
    }

    fn transition(id: &str) -> InstanceLifecycleTransition {
        InstanceLifecycleTransition {
            instance_id: id.to_string(),
            transition: Transition::Launching,
        }
    }

    #[tokio::test]
    async fn test_enqueue_registers_queue_and_roundtrips_bytes() {
        let queue = store(DEFAULT_MAX_RETRIES);
        let envelope = JobEnvelope::for_job(transition("i-1"));
        let payload = envelope.to_payload().unwrap();

        queue.enqueue(&envelope).await.unwrap();

        assert_eq!(queue.known_queues().await.unwrap(), vec![Q.to_string()]);
        let popped = queue.dequeue_payload(Q, NO_WAIT).await.unwrap();
        assert_eq!(popped, Some(payload));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = store(DEFAULT_MAX_RETRIES);
        queue.push(transition("i-1")).await.unwrap();
        queue.push(transition("i-2")).await.unwrap();

        let first = queue.dequeue(Q, NO_WAIT).await.unwrap().unwrap();
        let second = queue.dequeue(Q, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first.job_id, "i-1");
        assert_eq!(second.job_id, "i-2");
        assert!(queue.dequeue(Q, NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_with_is_all_or_nothing() {
        let kv = Arc::new(MemoryStore::new());
        let queue = QueueStore::new(kv.clone(), DEFAULT_MAX_RETRIES);
        // A queue key of the wrong kind makes the push half of the batch fail.
        kv.transact(vec![KvOp::hset(
            queue_key(Q),
            vec![("f".to_string(), "v".to_string())],
        )])
        .await
        .unwrap();

        let err = queue
            .push_with(
                transition("i-1"),
                vec![KvOp::hset(
                    "record:i-1",
                    vec![("state".to_string(), "pending".to_string())],
                )],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
        assert!(kv.hget("record:i-1", "state").await.unwrap().is_none());

        let queue = store(DEFAULT_MAX_RETRIES);
        queue
            .push_with(transition("i-2"), vec![KvOp::sadd("records", "i-2")])
            .await
            .unwrap();
        assert_eq!(queue.depth(Q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requeue_waits_out_a_growing_backoff() {
        let clock = Arc::new(ManualClock::default());
        let queue = clocked(&clock);
        let envelope = JobEnvelope::for_job(transition("i-1")).into_raw().unwrap();

        let due = queue.requeue(&envelope).await.unwrap().unwrap();
        assert_eq!((due - clock.now()).num_seconds(), 5);
        assert_eq!(queue.depth(Q).await.unwrap(), 0);
        assert_eq!(queue.scheduled(Q).await.unwrap(), 1);
        assert!(queue.dequeue(Q, NO_WAIT).await.unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        let first = queue.dequeue(Q, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first.retry_count, 1);
        assert_eq!(queue.scheduled(Q).await.unwrap(), 0);

        let due = queue.requeue(&first).await.unwrap().unwrap();
        assert_eq!((due - clock.now()).num_seconds(), 10);

        clock.advance(Duration::from_secs(5));
        assert!(queue.dequeue(Q, NO_WAIT).await.unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        let second = queue.dequeue(Q, NO_WAIT).await.unwrap().unwrap();
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.job_id, "i-1");
    }

    #[tokio::test]
    async fn test_repeated_failures_keep_the_job_scheduled() {
        let clock = Arc::new(ManualClock::default());
        let queue = clocked(&clock);
        queue.push(transition("i-1")).await.unwrap();

        let mut attempts = 0;
        for _ in 0..=DEFAULT_MAX_RETRIES {
            if let Some(envelope) = queue.dequeue(Q, NO_WAIT).await.unwrap() {
                attempts += 1;
                queue.requeue(&envelope).await.unwrap();
            }
        }

        assert_eq!(attempts, 1);
        assert_eq!(queue.scheduled(Q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_promotion_happens_once() {
        let clock = Arc::new(ManualClock::default());
        let queue = clocked(&clock);
        let envelope = JobEnvelope::for_job(transition("i-1")).into_raw().unwrap();
        queue.requeue(&envelope).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(queue.promote_due(Q).await.unwrap(), 1);
        assert_eq!(queue.promote_due(Q).await.unwrap(), 0);
        assert_eq!(queue.depth(Q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requeue_drops_when_disabled_or_exhausted() {
        let queue = store(2);
        let disabled = JobEnvelope::for_job(transition("i-1"))
            .with_retry(false)
            .into_raw()
            .unwrap();
        assert!(queue.requeue(&disabled).await.unwrap().is_none());

        let mut exhausted = JobEnvelope::for_job(transition("i-2")).into_raw().unwrap();
        exhausted.retry_count = 2;
        assert!(queue.requeue(&exhausted).await.unwrap().is_none());

        assert_eq!(queue.depth(Q).await.unwrap(), 0);
        assert_eq!(queue.scheduled(Q).await.unwrap(), 0);
    }
}
