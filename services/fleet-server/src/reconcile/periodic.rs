//! Reconciliation loop.
//!
//! Runs a fixed list of named, idempotent jobs once per interval, in order,
//! on one task. A failing or panicking job is logged and the remaining jobs
//! still run; the loop itself only stops on shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_reconcile::RetryPolicy;
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::db::FleetCache;
use crate::provider::CloudProvider;
use crate::workers::HandlerError;

/// A parameterless job run on every tick.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), HandlerError>;
}

/// Per-tick outcome counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
}

/// Fixed-interval runner of periodic jobs.
pub struct ReconciliationLoop {
    jobs: Vec<Arc<dyn PeriodicJob>>,
    interval: Duration,
}

impl ReconciliationLoop {
    /// A zero `interval` is raised to one millisecond.
    pub fn new(jobs: Vec<Arc<dyn PeriodicJob>>, interval: Duration) -> Self {
        Self {
            jobs,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Run the loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            jobs = ?self.jobs.iter().map(|j| j.name().to_string()).collect::<Vec<_>>(),
            "Starting reconciliation loop"
        );

        // The first tick fires immediately so the fleet cache is warm at startup.
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs every job once.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for job in &self.jobs {
            let outcome = AssertUnwindSafe(job.run()).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {
                    debug!(job = job.name(), "Periodic job complete");
                    report.succeeded += 1;
                }
                Ok(Err(e)) => {
                    error!(job = job.name(), error = %e, "Periodic job failed");
                    report.failed += 1;
                }
                Err(_) => {
                    error!(job = job.name(), "Periodic job panicked");
                    report.panicked += 1;
                }
            }
        }

        report
    }
}

/// Refreshes the fleet cache from the provider.
///
/// Each describe call gets a bounded number of attempts. If every attempt
/// fails, or the provider has no snapshot to give, the cache is left alone
/// for this tick and ages out on its own TTL.
pub struct Ec2Sync {
    provider: Arc<dyn CloudProvider>,
    cache: FleetCache,
    ttl: Duration,
    retry: RetryPolicy,
}

impl Ec2Sync {
    pub fn new(provider: Arc<dyn CloudProvider>, cache: FleetCache, ttl: Duration) -> Self {
        Self {
            provider,
            cache,
            ttl,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn sync_instances(&self) -> Result<(), HandlerError> {
        let snapshot = self
            .retry
            .run("describe_instances", || self.provider.describe_instances())
            .await?;
        let Some(instances) = snapshot else {
            warn!("Provider returned no instance snapshot, keeping cache");
            return Ok(());
        };
        self.cache.store_instances(&instances, self.ttl).await?;
        debug!(count = instances.len(), "Synced instances");
        Ok(())
    }

    async fn sync_images(&self) -> Result<(), HandlerError> {
        let snapshot = self
            .retry
            .run("describe_images", || self.provider.describe_images())
            .await?;
        let Some(images) = snapshot else {
            warn!("Provider returned no image snapshot, keeping cache");
            return Ok(());
        };
        self.cache.store_images(&images, self.ttl).await?;
        debug!(count = images.len(), "Synced images");
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for Ec2Sync {
    fn name(&self) -> &str {
        "ec2-sync"
    }

    async fn run(&self) -> Result<(), HandlerError> {
        let instances = self.sync_instances().await;
        let images = self.sync_images().await;
        instances.and(images)
    }
}

/// Pings the service's own health endpoint so hosting that idles
/// unrequested apps keeps it awake.
pub struct Keepalive {
    client: reqwest::Client,
    url: String,
}

impl Keepalive {
    pub fn new(public_url: &str) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/healthz", public_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl PeriodicJob for Keepalive {
    fn name(&self) -> &str {
        "keepalive"
    }

    async fn run(&self) -> Result<(), HandlerError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HandlerError::Fatal(format!("keepalive request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HandlerError::Fatal(format!(
                "keepalive got status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Filter, MemoryStore};
    use crate::provider::{FakeProvider, ProviderError};
    use fleet_events::Instance;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Counting(&'static str, AtomicUsize);

    #[async_trait]
    impl PeriodicJob for Counting {
        fn name(&self) -> &str {
            self.0
        }
        async fn run(&self) -> Result<(), HandlerError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl PeriodicJob for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }
        async fn run(&self) -> Result<(), HandlerError> {
            panic!("kaboom");
        }
    }

    struct Failing;

    #[async_trait]
    impl PeriodicJob for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn run(&self) -> Result<(), HandlerError> {
            Err(HandlerError::Fatal("nope".to_string()))
        }
    }

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_block_later_jobs() {
        let later = Arc::new(Counting("later", AtomicUsize::new(0)));
        let reconciler = ReconciliationLoop::new(
            vec![Arc::new(Exploding), Arc::new(Failing), later.clone()],
            Duration::from_secs(60),
        );

        let report = reconciler.tick().await;
        assert_eq!(
            report,
            TickReport {
                succeeded: 1,
                failed: 1,
                panicked: 1
            }
        );

        reconciler.tick().await;
        assert_eq!(later.1.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let job = Arc::new(Counting("tick", AtomicUsize::new(0)));
        let reconciler = ReconciliationLoop::new(vec![job.clone()], Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { reconciler.run(rx).await });
        for _ in 0..100 {
            if job.1.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.1.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_does_not_panic() {
        let job = Arc::new(Counting("tick", AtomicUsize::new(0)));
        let reconciler = ReconciliationLoop::new(vec![job.clone()], Duration::ZERO);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { reconciler.run(rx).await });
        for _ in 0..100 {
            if job.1.load(Ordering::SeqCst) > 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(job.1.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_sync_replaces_cache() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_instances(Some(vec![instance("i-1"), instance("i-2")]));
        let cache = FleetCache::new(Arc::new(MemoryStore::new()));
        let sync = Ec2Sync::new(provider, cache.clone(), Duration::from_secs(600))
            .with_retry(RetryPolicy::immediate(3));

        sync.run().await.unwrap();
        assert_eq!(cache.fetch_instances(&Filter::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_retries_transient_failures() {
        let provider = Arc::new(FakeProvider::new());
        provider.set_instances(Some(vec![instance("i-1")]));
        provider.fail_next("describe_instances", ProviderError::Transport("reset".into()));
        provider.fail_next("describe_instances", ProviderError::Transport("reset".into()));
        let cache = FleetCache::new(Arc::new(MemoryStore::new()));
        let sync = Ec2Sync::new(provider.clone(), cache.clone(), Duration::from_secs(600))
            .with_retry(RetryPolicy::immediate(3));

        sync.run().await.unwrap();
        assert_eq!(provider.call_count("describe_instances"), 3);
        assert_eq!(cache.fetch_instances(&Filter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_failure_or_no_snapshot_keeps_cache() {
        let provider = Arc::new(FakeProvider::new());
        let cache = FleetCache::new(Arc::new(MemoryStore::new()));
        cache
            .store_instances(&[instance("i-old")], Duration::from_secs(600))
            .await
            .unwrap();
        let sync = Ec2Sync::new(provider.clone(), cache.clone(), Duration::from_secs(600))
            .with_retry(RetryPolicy::immediate(3));

        for _ in 0..3 {
            provider.fail_next("describe_instances", ProviderError::Transport("down".into()));
        }
        assert!(sync.run().await.is_err());
        assert_eq!(cache.fetch_instances(&Filter::new()).await.unwrap().len(), 1);

        provider.set_instances(None);
        sync.run().await.unwrap();
        let cached = cache.fetch_instances(&Filter::new()).await.unwrap();
        assert_eq!(cached[0].id, "i-old");
    }

    #[tokio::test]
    async fn test_keepalive_checks_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Keepalive::new(&server.uri()).unwrap().run().await.unwrap();

        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&broken)
            .await;
        assert!(Keepalive::new(&broken.uri()).unwrap().run().await.is_err());
    }
}
