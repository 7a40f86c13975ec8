//! Test infrastructure for deterministic queue testing.
//!
//! [`TestEnv`] wires an in-memory store, a [`TestClock`], a scripted
//! publisher and a recording notifier into a [`QueueManager`]. Tests drive
//! the scheduler explicitly with [`TestEnv::run_until_idle`], which moves the
//! clock past backoff windows instead of sleeping through them.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use courier_core::{
    ContentItem, ContentItemId, DeliveryJob, Destination, DestinationId, JobId, JobStatus,
    Priority,
};
pub use courier_core::{Clock, TestClock};
use courier_delivery::{
    ConflictPolicy, ContentStore, DestinationStore, InMemoryStorage, JobStore, QueueConfig,
    QueueManager, RetryPolicy,
};
use tracing::debug;

pub mod fixtures;
pub mod notifier;
pub mod publisher;

pub use fixtures::{ContentItemBuilder, DestinationBuilder};
pub use notifier::RecordingNotifier;
pub use publisher::{PublishCall, ScriptedPublisher, ScriptedPublisherFactory};

/// Upper bound on scheduler steps in [`TestEnv::run_until_idle`].
const MAX_STEPS: usize = 1_000;

/// Builder for [`TestEnv`].
#[derive(Debug)]
pub struct TestEnvBuilder {
    config: QueueConfig,
    retry_policy: RetryPolicy,
    publisher: Arc<ScriptedPublisher>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            config: QueueConfig::default(),
            retry_policy: RetryPolicy { jitter_percent: 0.0, ..RetryPolicy::default() },
            publisher: Arc::new(ScriptedPublisher::new()),
        }
    }
}

impl TestEnvBuilder {
    /// Sets the concurrency bound.
    #[must_use]
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.config.conflict_policy = policy;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy.max_retries = max_retries;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Uses `publisher` for every destination.
    #[must_use]
    pub fn publisher(mut self, publisher: ScriptedPublisher) -> Self {
        self.publisher = Arc::new(publisher);
        self
    }

    /// Builds the environment. The scheduler loop is not started.
    pub fn build(self) -> TestEnv {
        let storage = InMemoryStorage::new();
        let clock = TestClock::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let factory = Arc::new(ScriptedPublisherFactory::new(self.publisher.clone()));

        let queue = QueueManager::with_storage(Arc::new(storage.clone()), factory)
            .config(self.config)
            .retry_policy(self.retry_policy)
            .notifier(notifier.clone())
            .clock(Arc::new(clock.clone()))
            .build();

        TestEnv { storage, clock, publisher: self.publisher, notifier, queue }
    }
}

/// Queue manager over in-memory storage with controllable time.
#[derive(Debug)]
pub struct TestEnv {
    /// Backing store shared with the queue.
    pub storage: InMemoryStorage,
    /// Clock the queue reads.
    pub clock: TestClock,
    /// Publisher used for every destination.
    pub publisher: Arc<ScriptedPublisher>,
    /// Received notifications.
    pub notifier: Arc<RecordingNotifier>,
    /// The queue under test.
    pub queue: QueueManager,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    /// Environment with default settings and an always-succeeding publisher.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }

    /// Inserts a content item built from `builder`.
    pub async fn create_content_item(&self, builder: ContentItemBuilder) -> Result<ContentItem> {
        let item = builder.build(self.clock.now());
        self.storage.insert_content_item(item.clone()).await?;
        Ok(item)
    }

    /// Inserts a destination built from `builder`.
    pub async fn create_destination(&self, builder: DestinationBuilder) -> Result<Destination> {
        let destination = builder.build(self.clock.now());
        self.storage.insert_destination(destination.clone()).await?;
        Ok(destination)
    }

    /// Inserts a default item and a local destination.
    pub async fn seed_pair(&self) -> Result<(ContentItem, Destination)> {
        let item = self.create_content_item(ContentItemBuilder::new()).await?;
        let destination = self.create_destination(DestinationBuilder::new()).await?;
        Ok((item, destination))
    }

    /// Seeds a fresh pair and enqueues it at `priority`.
    pub async fn enqueue_new(&self, priority: Priority) -> Result<JobId> {
        let (item, destination) = self.seed_pair().await?;
        Ok(self.queue.enqueue(item.id, destination.id, priority).await?)
    }

    /// Loads a job that must exist.
    pub async fn job(&self, id: JobId) -> Result<DeliveryJob> {
        self.storage.find_job(id).await?.with_context(|| format!("job {id} not found"))
    }

    /// Loads a content item that must exist.
    pub async fn content_item(&self, id: ContentItemId) -> Result<ContentItem> {
        self.storage
            .find_content_item(id)
            .await?
            .with_context(|| format!("content item {id} not found"))
    }

    /// Loads a destination that must exist.
    pub async fn destination(&self, id: DestinationId) -> Result<Destination> {
        self.storage
            .find_destination(id)
            .await?
            .with_context(|| format!("destination {id} not found"))
    }

    /// Jobs currently in `status`.
    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<DeliveryJob>> {
        Ok(self.storage.find_jobs_by_status(status).await?)
    }

    /// Moves the clock forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Waits until no job is in flight.
    pub async fn wait_for_in_flight(&self) -> Result<()> {
        let queue = self.queue.clone();
        wait_until(Duration::from_secs(5), move || {
            let queue = queue.clone();
            async move { queue.status().await.is_ok_and(|s| !s.is_processing) }
        })
        .await
    }

    /// Runs scheduling passes until no job can make progress.
    ///
    /// Whenever only backed-off jobs remain, the clock jumps to the earliest
    /// `scheduled_for`. Returns once nothing is pending or the queue is
    /// paused.
    pub async fn run_until_idle(&self) -> Result<()> {
        for _ in 0..MAX_STEPS {
            self.queue.schedule_pass().await;
            self.wait_for_in_flight().await?;

            if self.queue.is_paused() {
                return Ok(());
            }

            let pending = self.jobs_with_status(JobStatus::Pending).await?;
            if pending.is_empty() {
                return Ok(());
            }

            let now = self.clock.now();
            if pending.iter().any(|job| job.is_dispatchable(now)) {
                continue;
            }

            let Some(next) = pending.iter().filter_map(|job| job.scheduled_for).min() else {
                continue;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(wait_ms = wait.as_millis(), "advancing test clock to next retry");
            self.clock.jump_to(next);
        }

        bail!("queue did not become idle within {MAX_STEPS} steps")
    }
}

/// Polls `condition` every 5ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
