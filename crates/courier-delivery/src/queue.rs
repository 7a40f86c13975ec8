//! Delivery queue scheduler.
//!
//! [`QueueManager`] admits delivery jobs, dispatches them to publishers under
//! a concurrency bound, and records each outcome: completion, a backed-off
//! retry, or terminal failure. The job store is the only source of truth, so
//! a restarted manager picks up exactly where the previous process stopped.
//!
//! # Scheduling
//!
//! A single loop task runs scheduling passes. A pass repeatedly selects the
//! highest-priority dispatchable job, claims it with a compare-and-set from
//! `pending` to `processing`, and spawns a task for it, until the queue is
//! paused, the bound is reached, or nothing is due. Enqueue, resume and job
//! completion wake the loop; a periodic tick also wakes it so backed-off
//! retries are picked up once `scheduled_for` passes, and runs the
//! stale-job recovery sweep.
//!
//! Passes never overlap. A trigger that arrives while a pass runs causes one
//! more pass after it.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use courier_core::{
    Clock, ContentItemId, ContentUpdate, CoreError, DeliveryJob, DestinationId, JobId, JobStatus,
    JobUpdate, NoOpNotifier, Notification, NotificationKind, Notifier, Priority, RealClock,
    StatusCounts,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    conflict::{ConflictPolicy, ConflictResolver, Resolution},
    error::{DeliveryError, ErrorCategory, QueueError},
    publisher::{PublishContext, PublishOutcome, PublisherFactory},
    retry::{RetryDecision, RetryPolicy, RetryStrategy},
    storage::{ContentStore, DestinationStore, JobStore},
};

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs processing at once.
    pub max_concurrent: usize,

    /// Interval of the periodic scheduling tick.
    pub poll_interval: Duration,

    /// Age after which a `processing` job not owned by this process is
    /// treated as an interrupted attempt.
    pub stale_after: Duration,

    /// Reaction to items already published to a job's destination.
    pub conflict_policy: ConflictPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: crate::DEFAULT_MAX_CONCURRENT,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            stale_after: crate::DEFAULT_STALE_AFTER,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// Snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Jobs per status.
    pub counts: StatusCounts,
    /// Total jobs.
    pub total: u64,
    /// Completed jobs as a percentage of all jobs, 0 when empty.
    pub progress: f64,
    /// True while any job is in flight in this process.
    pub is_processing: bool,
    /// True while dispatch is paused.
    pub is_paused: bool,
}

impl QueueStatus {
    fn from_counts(counts: StatusCounts, is_processing: bool, is_paused: bool) -> Self {
        let total = counts.total();
        #[allow(clippy::cast_precision_loss)]
        let progress =
            if total == 0 { 0.0 } else { counts.completed as f64 / total as f64 * 100.0 };
        Self { counts, total, progress, is_processing, is_paused }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    paused: bool,
    /// Jobs reserved or running in this process.
    in_flight: HashSet<JobId>,
    /// Pending jobs a `cancel` call is working on; never dispatched.
    cancelling: HashSet<JobId>,
    pass_running: bool,
    pass_requested: bool,
}

struct Inner {
    jobs: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    destinations: Arc<dyn DestinationStore>,
    publishers: Arc<dyn PublisherFactory>,
    resolver: ConflictResolver,
    retry: RetryStrategy,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    state: Mutex<SchedulerState>,
    wake: Notify,
    cancel: CancellationToken,
    tasks: TaskTracker,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`QueueManager`].
pub struct QueueManagerBuilder {
    jobs: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    destinations: Arc<dyn DestinationStore>,
    publishers: Arc<dyn PublisherFactory>,
    retry_policy: RetryPolicy,
    config: QueueConfig,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl QueueManagerBuilder {
    /// Sets the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the scheduler configuration.
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the notification sink.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the manager. The scheduler does not run until
    /// [`QueueManager::start`].
    pub fn build(self) -> QueueManager {
        let resolver = ConflictResolver::new(
            self.content.clone(),
            self.jobs.clone(),
            self.config.conflict_policy,
        );

        QueueManager {
            inner: Arc::new(Inner {
                jobs: self.jobs,
                content: self.content,
                destinations: self.destinations,
                publishers: self.publishers,
                resolver,
                retry: RetryStrategy::new(self.retry_policy),
                notifier: self.notifier,
                clock: self.clock,
                config: self.config,
                state: Mutex::new(SchedulerState::default()),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }
}

enum Attempt {
    Published { outcome: PublishOutcome, title: String, destination: String },
    Skipped { reason: String },
}

/// Handle to the delivery queue. Clones share the same scheduler.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.inner.config)
            .field("retry_policy", self.inner.retry.policy())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Starts building a manager from separate stores.
    pub fn builder(
        jobs: Arc<dyn JobStore>,
        content: Arc<dyn ContentStore>,
        destinations: Arc<dyn DestinationStore>,
        publishers: Arc<dyn PublisherFactory>,
    ) -> QueueManagerBuilder {
        QueueManagerBuilder {
            jobs,
            content,
            destinations,
            publishers,
            retry_policy: RetryPolicy::default(),
            config: QueueConfig::default(),
            notifier: Arc::new(NoOpNotifier),
            clock: Arc::new(RealClock::new()),
        }
    }

    /// Starts building a manager over a store implementing all three
    /// contracts.
    pub fn with_storage<S>(
        storage: Arc<S>,
        publishers: Arc<dyn PublisherFactory>,
    ) -> QueueManagerBuilder
    where
        S: JobStore + ContentStore + DestinationStore,
    {
        Self::builder(storage.clone(), storage.clone(), storage, publishers)
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Retry policy applied to failed attempts.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.inner.retry.policy()
    }

    /// Admits a job delivering `content_item_id` to `destination_id`.
    ///
    /// # Errors
    ///
    /// - `Validation` if either entity does not exist
    /// - `DuplicateJob` if the pair already has a pending or processing job
    /// - `Storage` on store failures
    pub async fn enqueue(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
        priority: Priority,
    ) -> Result<JobId> {
        let inner = &self.inner;

        if inner.content.find_content_item(content_item_id).await?.is_none() {
            return Err(QueueError::Validation(format!(
                "content item {content_item_id} does not exist"
            )));
        }
        if inner.destinations.find_destination(destination_id).await?.is_none() {
            return Err(QueueError::Validation(format!(
                "destination {destination_id} does not exist"
            )));
        }

        let job_id = self.admit(content_item_id, destination_id, priority).await?;
        self.trigger();
        Ok(job_id)
    }

    /// Enqueues `content_item_id` for every enabled default destination.
    ///
    /// Destinations that already have an active job for the item are
    /// skipped. Returns the ids of the created jobs.
    ///
    /// # Errors
    ///
    /// `Validation` if the item does not exist, `Storage` on store failures.
    pub async fn enqueue_default(
        &self,
        content_item_id: ContentItemId,
        priority: Priority,
    ) -> Result<Vec<JobId>> {
        let inner = &self.inner;

        if inner.content.find_content_item(content_item_id).await?.is_none() {
            return Err(QueueError::Validation(format!(
                "content item {content_item_id} does not exist"
            )));
        }

        let mut created = Vec::new();
        for destination in inner.destinations.list_destinations().await? {
            if !destination.enabled || !destination.is_default {
                continue;
            }
            match self.admit(content_item_id, destination.id, priority).await {
                Ok(job_id) => created.push(job_id),
                Err(QueueError::DuplicateJob { existing }) => {
                    debug!(
                        job_id = %existing,
                        destination_id = %destination.id,
                        "default destination already has an active job"
                    );
                },
                Err(e) => return Err(e),
            }
        }

        if !created.is_empty() {
            self.trigger();
        }
        Ok(created)
    }

    async fn admit(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
        priority: Priority,
    ) -> Result<JobId> {
        let inner = &self.inner;

        if let Some(existing) =
            inner.resolver.is_duplicate_enqueue(content_item_id, destination_id).await?
        {
            return Err(QueueError::DuplicateJob { existing });
        }

        let job = DeliveryJob::new(
            content_item_id,
            destination_id,
            priority,
            inner.retry.policy().max_retries,
            inner.clock.now(),
        );

        match inner.jobs.insert_job(job.clone()).await {
            Ok(()) => {},
            Err(CoreError::ConstraintViolation(_)) => {
                // Lost a race with a concurrent enqueue of the same pair.
                if let Some(existing) =
                    inner.resolver.is_duplicate_enqueue(content_item_id, destination_id).await?
                {
                    return Err(QueueError::DuplicateJob { existing });
                }
                return Err(QueueError::Validation(format!("job {} already exists", job.id)));
            },
            Err(e) => return Err(e.into()),
        }

        info!(
            job_id = %job.id,
            content_item_id = %content_item_id,
            destination_id = %destination_id,
            priority = %priority,
            "job enqueued"
        );
        Ok(job.id)
    }

    /// Stops dispatching new jobs. In-flight jobs finish. Idempotent.
    pub fn pause(&self) {
        let mut state = self.state();
        if !state.paused {
            state.paused = true;
            info!(in_flight = state.in_flight.len(), "queue paused");
        }
    }

    /// Resumes dispatching and triggers a pass. Idempotent.
    pub fn resume(&self) {
        {
            let mut state = self.state();
            if state.paused {
                state.paused = false;
                info!("queue resumed");
            }
        }
        self.trigger();
    }

    /// Returns true while dispatch is paused.
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Resets a failed job to pending with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown job
    /// - `InvalidState` if the job is not `failed`
    /// - `DuplicateJob` if another job for the pair became active meanwhile
    pub async fn retry_item(&self, job_id: JobId) -> Result<()> {
        let job = self
            .inner
            .jobs
            .find_job(job_id)
            .await?
            .ok_or_else(|| QueueError::not_found("job", job_id))?;

        self.reset_failed(&job).await?;
        self.trigger();
        Ok(())
    }

    /// Resets every failed job. Returns how many were reset.
    ///
    /// Jobs whose pair already has an active job are left failed.
    ///
    /// # Errors
    ///
    /// `Storage` on store failures.
    pub async fn retry_all_failed(&self) -> Result<usize> {
        let failed = self.inner.jobs.find_jobs_by_status(JobStatus::Failed).await?;

        let mut reset = 0;
        for job in &failed {
            match self.reset_failed(job).await {
                Ok(()) => reset += 1,
                Err(QueueError::DuplicateJob { existing }) => {
                    debug!(
                        job_id = %job.id,
                        active_job_id = %existing,
                        "left failed job untouched"
                    );
                },
                Err(e) => return Err(e),
            }
        }

        info!(reset, "retrying failed jobs");
        if reset > 0 {
            self.trigger();
        }
        Ok(reset)
    }

    async fn reset_failed(&self, job: &DeliveryJob) -> Result<()> {
        let inner = &self.inner;

        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                job_id: job.id,
                status: job.status,
                expected: JobStatus::Failed,
            });
        }
        if let Some(existing) =
            inner.resolver.is_duplicate_enqueue(job.content_item_id, job.destination_id).await?
        {
            return Err(QueueError::DuplicateJob { existing });
        }

        inner.jobs.update_job(job.id, JobUpdate::reset()).await?;

        match inner.content.update_content_item(job.content_item_id, ContentUpdate::reset()).await {
            Ok(()) => {},
            Err(CoreError::NotFound(_)) => {
                warn!(job_id = %job.id, "content item of retried job no longer exists");
            },
            Err(e) => return Err(e.into()),
        }

        info!(job_id = %job.id, "job reset for retry");
        Ok(())
    }

    /// Cancels a pending job.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown job, `InvalidState` unless it is `pending`.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        {
            let mut state = self.state();
            if state.in_flight.contains(&job_id) || !state.cancelling.insert(job_id) {
                return Err(QueueError::InvalidState {
                    job_id,
                    status: JobStatus::Processing,
                    expected: JobStatus::Pending,
                });
            }
        }

        let result = self.cancel_reserved(job_id).await;
        self.state().cancelling.remove(&job_id);
        self.trigger();
        result
    }

    async fn cancel_reserved(&self, job_id: JobId) -> Result<()> {
        let inner = &self.inner;
        let job =
            inner.jobs.find_job(job_id).await?.ok_or_else(|| QueueError::not_found("job", job_id))?;

        if job.status != JobStatus::Pending {
            return Err(QueueError::InvalidState {
                job_id,
                status: job.status,
                expected: JobStatus::Pending,
            });
        }

        inner.jobs.update_job(job_id, JobUpdate::cancelled(inner.clock.now())).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    /// Counts, progress and scheduler flags.
    ///
    /// # Errors
    ///
    /// `Storage` on store failures.
    pub async fn status(&self) -> Result<QueueStatus> {
        let counts = self.inner.jobs.status_counts().await?;
        let state = self.state();
        Ok(QueueStatus::from_counts(counts, !state.in_flight.is_empty(), state.paused))
    }

    /// Returns orphaned `processing` jobs older than `stale_after` to the
    /// pending pool. Returns how many jobs were recovered or failed.
    ///
    /// # Errors
    ///
    /// `Storage` on store failures.
    pub async fn recover_stale_jobs(&self) -> Result<usize> {
        self.recover_older_than(self.inner.config.stale_after).await
    }

    async fn recover_older_than(&self, threshold: Duration) -> Result<usize> {
        let inner = &self.inner;
        let owned = self.state().in_flight.clone();
        let now = inner.clock.now();

        let stale = inner.jobs.find_stale_jobs(saturating_sub(now, threshold)).await?;

        let mut recovered = 0;
        for job in stale.into_iter().filter(|job| !owned.contains(&job.id)) {
            let retry_count = job.retry_count + 1;
            let message = "delivery attempt was interrupted";

            if retry_count > job.max_retries {
                warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    "interrupted job exhausted its retries"
                );
                inner.jobs.update_job(job.id, JobUpdate::failed(message, now)).await?;
                self.record_terminal_failure(&job, message).await;
            } else {
                warn!(job_id = %job.id, retry_count, "recovering interrupted job");
                let update = JobUpdate::retry_at(retry_count, message, now);
                inner.jobs.update_job(job.id, update).await?;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "recovered stale jobs");
            self.trigger();
        }
        Ok(recovered)
    }

    /// Deletes completed and cancelled jobs that finished more than
    /// `older_than` ago. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// `Storage` on store failures.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        let cutoff = saturating_sub(self.inner.clock.now(), older_than);
        let purged = self.inner.jobs.purge_finished_jobs(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged finished jobs");
        }
        Ok(purged)
    }

    /// Checks connectivity to a destination.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown destination, `Delivery` if no publisher can
    /// be built for it.
    pub async fn test_destination(&self, destination_id: DestinationId) -> Result<bool> {
        let destination = self
            .inner
            .destinations
            .find_destination(destination_id)
            .await?
            .ok_or_else(|| QueueError::not_found("destination", destination_id))?;

        let publisher = self.inner.publishers.publisher_for(&destination)?;
        let reachable = publisher.test_connection().await;

        info!(
            destination_id = %destination_id,
            protocol = publisher.protocol(),
            reachable,
            "tested destination connection"
        );
        Ok(reachable)
    }

    /// Runs the startup recovery sweep and spawns the scheduler loop.
    ///
    /// Calling `start` on a running manager does nothing. Returns the number
    /// of jobs the sweep recovered.
    ///
    /// # Errors
    ///
    /// `Storage` if the recovery sweep fails.
    pub async fn start(&self) -> Result<usize> {
        if self.scheduler_slot().is_some() {
            return Ok(0);
        }

        // Nothing is in flight yet, so every processing job is orphaned.
        let recovered = self.recover_older_than(Duration::ZERO).await?;

        let mut slot = self.scheduler_slot();
        if slot.is_none() {
            let manager = self.clone();
            *slot = Some(tokio::spawn(
                async move { manager.run_scheduler().await }.instrument(info_span!("scheduler")),
            ));
            info!(
                max_concurrent = self.inner.config.max_concurrent,
                poll_interval_ms = self.inner.config.poll_interval.as_millis(),
                recovered,
                "queue manager started"
            );
        }
        drop(slot);

        self.trigger();
        Ok(recovered)
    }

    /// Stops the scheduler and waits up to `timeout` for in-flight jobs.
    ///
    /// Returns true if every in-flight job finished in time. Jobs that did
    /// not are recovered by the next process start. A manager that was shut
    /// down does not dispatch again.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("shutting down queue manager");
        self.inner.cancel.cancel();

        let handle = self.scheduler_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler task failed");
            }
        }

        self.inner.tasks.close();
        let drained = tokio::time::timeout(timeout, self.inner.tasks.wait()).await.is_ok();
        if drained {
            info!("queue manager stopped");
        } else {
            warn!(
                in_flight = self.state().in_flight.len(),
                "shutdown timeout exceeded with jobs in flight"
            );
        }
        drained
    }

    /// Runs one scheduling pass now, or queues another pass if one is
    /// already running.
    pub async fn schedule_pass(&self) {
        {
            let mut state = self.state();
            if state.pass_running {
                state.pass_requested = true;
                return;
            }
            state.pass_running = true;
        }
        let _guard = PassGuard(self);

        loop {
            match self.dispatch_due().await {
                Ok(0) => {},
                Ok(dispatched) => debug!(dispatched, "scheduling pass dispatched jobs"),
                Err(e) => warn!(error = %e, "scheduling pass failed"),
            }

            let mut state = self.state();
            if !state.pass_requested {
                break;
            }
            state.pass_requested = false;
        }
    }

    async fn dispatch_due(&self) -> Result<usize> {
        let inner = &self.inner;
        let max = inner.config.max_concurrent;
        let mut dispatched = 0;

        loop {
            let available = {
                let state = self.state();
                if state.paused {
                    return Ok(dispatched);
                }
                max.saturating_sub(state.in_flight.len())
            };
            if available == 0 {
                return Ok(dispatched);
            }

            let now = inner.clock.now();
            let candidates = inner.jobs.find_dispatchable(now, available).await?;
            if candidates.is_empty() {
                return Ok(dispatched);
            }

            let mut claimed_any = false;
            for mut job in candidates {
                {
                    let mut state = self.state();
                    if state.paused || state.in_flight.len() >= max {
                        return Ok(dispatched);
                    }
                    if state.cancelling.contains(&job.id) || !state.in_flight.insert(job.id) {
                        continue;
                    }
                }

                let claimed = match inner.jobs.claim_job(job.id, now).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        self.state().in_flight.remove(&job.id);
                        return Err(e.into());
                    },
                };
                if !claimed {
                    self.state().in_flight.remove(&job.id);
                    continue;
                }

                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                debug!(
                    job_id = %job.id,
                    priority = %job.priority,
                    retry_count = job.retry_count,
                    "dispatching job"
                );
                self.spawn_job(job);
                claimed_any = true;
                dispatched += 1;
            }

            if !claimed_any {
                return Ok(dispatched);
            }
        }
    }

    fn spawn_job(&self, job: DeliveryJob) {
        let manager = self.clone();
        let span = info_span!(
            "delivery_job",
            job_id = %job.id,
            destination_id = %job.destination_id,
            attempt = job.retry_count + 1
        );

        self.inner.tasks.spawn(
            async move {
                let job_id = job.id;
                manager.execute(&job).await;
                manager.state().in_flight.remove(&job_id);
                manager.trigger();
            }
            .instrument(span),
        );
    }

    async fn run_scheduler(&self) {
        let inner = &self.inner;
        let mut ticker = tokio::time::interval(inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                () = inner.wake.notified() => {},
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_stale_jobs().await {
                        warn!(error = %e, "stale job recovery failed");
                    }
                },
            }

            if inner.cancel.is_cancelled() {
                break;
            }
            self.schedule_pass().await;
        }

        debug!("scheduler loop stopped");
    }

    async fn execute(&self, job: &DeliveryJob) {
        let recorded = match self.attempt(job).await {
            Ok(Attempt::Published { outcome, title, destination }) => {
                self.record_success(job, outcome, &title, &destination).await
            },
            Ok(Attempt::Skipped { reason }) => self.record_skip(job, reason).await,
            Err(error) => self.record_failure(job, error).await,
        };

        if let Err(e) = recorded {
            warn!(
                job_id = %job.id,
                error = %e,
                "failed to record job outcome; left for the recovery sweep"
            );
        }
    }

    async fn attempt(&self, job: &DeliveryJob) -> std::result::Result<Attempt, DeliveryError> {
        let inner = &self.inner;

        let item = inner.content.find_content_item(job.content_item_id).await?.ok_or_else(|| {
            DeliveryError::validation(format!("content item {} not found", job.content_item_id))
        })?;
        let destination =
            inner.destinations.find_destination(job.destination_id).await?.ok_or_else(|| {
                DeliveryError::validation(format!("destination {} not found", job.destination_id))
            })?;
        if !destination.enabled {
            return Err(DeliveryError::validation(format!(
                "destination {} is disabled",
                destination.name
            )));
        }

        let check = inner.resolver.check(job).await?;
        let context = match inner.resolver.resolve(job, &check) {
            Resolution::Skip { reason } => return Ok(Attempt::Skipped { reason }),
            Resolution::Proceed { existing_remote_id } => PublishContext { existing_remote_id },
        };

        let publisher = inner.publishers.publisher_for(&destination)?;
        debug!(protocol = publisher.protocol(), "publishing");
        let outcome = publisher.publish(&item, &context).await?;

        Ok(Attempt::Published { outcome, title: item.title, destination: destination.name })
    }

    async fn record_success(
        &self,
        job: &DeliveryJob,
        outcome: PublishOutcome,
        title: &str,
        destination: &str,
    ) -> std::result::Result<(), CoreError> {
        let inner = &self.inner;
        let now = inner.clock.now();

        let update = ContentUpdate::published(
            job.destination_id,
            outcome.published_url.clone(),
            outcome.remote_id.clone(),
            now,
        );
        inner.content.update_content_item(job.content_item_id, update).await?;
        inner.destinations.record_published(job.destination_id, now).await?;
        let update = JobUpdate::published(
            outcome.remote_id.clone(),
            outcome.published_url.clone(),
            now,
        );
        inner.jobs.update_job(job.id, update).await?;

        info!(
            job_id = %job.id,
            remote_id = outcome.remote_id.as_deref().unwrap_or_default(),
            published_url = outcome.published_url.as_deref().unwrap_or_default(),
            "job completed"
        );
        inner.notifier.notify(Notification {
            kind: NotificationKind::Success,
            message: format!("Published \"{title}\" to {destination}"),
            job_id: job.id,
            content_item_id: job.content_item_id,
            destination_id: job.destination_id,
        });
        Ok(())
    }

    async fn record_skip(
        &self,
        job: &DeliveryJob,
        reason: String,
    ) -> std::result::Result<(), CoreError> {
        let now = self.inner.clock.now();
        info!(job_id = %job.id, reason = %reason, "job skipped");
        self.inner.jobs.update_job(job.id, JobUpdate::skipped(reason, now)).await
    }

    async fn record_failure(
        &self,
        job: &DeliveryJob,
        error: DeliveryError,
    ) -> std::result::Result<(), CoreError> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let category = ErrorCategory::from(&error);

        match inner.retry.decide_within(job.retry_count, job.max_retries, &error, now) {
            RetryDecision::Retry { retry_count, next_attempt_at } => {
                warn!(
                    job_id = %job.id,
                    error = %error,
                    %category,
                    retry_count,
                    next_attempt_at = %next_attempt_at,
                    "delivery failed, scheduling retry"
                );
                let update = JobUpdate::retry_at(retry_count, error.to_string(), next_attempt_at);
                inner.jobs.update_job(job.id, update).await
            },
            RetryDecision::GiveUp { reason } => {
                error!(
                    job_id = %job.id,
                    error = %error,
                    %category,
                    retry_count = job.retry_count,
                    reason = %reason,
                    "delivery failed permanently"
                );
                inner.jobs.update_job(job.id, JobUpdate::failed(error.to_string(), now)).await?;
                self.record_terminal_failure(job, &error.to_string()).await;
                Ok(())
            },
        }
    }

    /// Item, destination and notification side effects of a failed job.
    async fn record_terminal_failure(&self, job: &DeliveryJob, message: &str) {
        let inner = &self.inner;

        let update = ContentUpdate::failed(message);
        if let Err(e) = inner.content.update_content_item(job.content_item_id, update).await {
            debug!(job_id = %job.id, error = %e, "could not mark content item failed");
        }
        if let Err(e) = inner.destinations.record_failure(job.destination_id).await {
            debug!(job_id = %job.id, error = %e, "could not update destination stats");
        }

        inner.notifier.notify(Notification {
            kind: NotificationKind::Failure,
            message: format!("Delivery to destination {} failed: {message}", job.destination_id),
            job_id: job.id,
            content_item_id: job.content_item_id,
            destination_id: job.destination_id,
        });
    }

    fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running flag even if a pass is cancelled mid-way.
struct PassGuard<'a>(&'a QueueManager);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.pass_running = false;
        state.pass_requested = false;
    }
}

fn saturating_sub(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_core::{ContentItem, Destination, DestinationKind, TestClock};

    use super::*;
    use crate::{publisher::Publisher, storage::memory::InMemoryStorage};

    #[derive(Debug, Default)]
    struct CountingPublisher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(
            &self,
            item: &ContentItem,
            _context: &PublishContext,
        ) -> crate::error::Result<PublishOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PublishOutcome {
                published_url: Some(format!("https://example.com/{}", item.id)),
                remote_id: Some("7".to_string()),
            })
        }

        async fn test_connection(&self) -> bool {
            true
        }

        fn protocol(&self) -> &'static str {
            "counting"
        }
    }

    struct Factory(Arc<CountingPublisher>);

    impl PublisherFactory for Factory {
        fn publisher_for(
            &self,
            _destination: &Destination,
        ) -> crate::error::Result<Arc<dyn Publisher>> {
            Ok(self.0.clone())
        }
    }

    async fn setup() -> (QueueManager, InMemoryStorage, Arc<CountingPublisher>, TestClock) {
        let store = InMemoryStorage::new();
        let publisher = Arc::new(CountingPublisher::default());
        let clock = TestClock::new();
        let factory = Arc::new(Factory(publisher.clone()));
        let manager = QueueManager::with_storage(Arc::new(store.clone()), factory)
            .clock(Arc::new(clock.clone()))
            .build();
        (manager, store, publisher, clock)
    }

    async fn seed(store: &InMemoryStorage) -> (ContentItemId, DestinationId) {
        let item = ContentItem::new("Hello", "World", Utc::now());
        let destination = Destination::new("local", DestinationKind::Local, Utc::now());
        let ids = (item.id, destination.id);
        store.insert_content_item(item).await.unwrap();
        store.insert_destination(destination).await.unwrap();
        ids
    }

    async fn drain(manager: &QueueManager) {
        for _ in 0..200 {
            manager.schedule_pass().await;
            if !manager.status().await.unwrap().is_processing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn enqueued_job_is_published_once() {
        let (manager, store, publisher, _clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;

        let job_id = manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        drain(&manager).await;

        let job = store.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        let item = store.find_content_item(item_id).await.unwrap().unwrap();
        assert_eq!(item.remote_id.as_deref(), Some("7"));
        assert_eq!(item.destination_id, Some(destination_id));

        let destination = store.find_destination(destination_id).await.unwrap().unwrap();
        assert_eq!(destination.stats.total_published, 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_entities_and_duplicates() {
        let (manager, store, _publisher, _clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;

        let err = manager.enqueue(ContentItemId::new(), destination_id, Priority::Normal).await;
        assert!(matches!(err, Err(QueueError::Validation(_))));
        let err = manager.enqueue(item_id, DestinationId::new(), Priority::Normal).await;
        assert!(matches!(err, Err(QueueError::Validation(_))));

        let first = manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        match manager.enqueue(item_id, destination_id, Priority::High).await {
            Err(QueueError::DuplicateJob { existing }) => assert_eq!(existing, first),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn paused_queue_dispatches_nothing() {
        let (manager, store, publisher, _clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;

        manager.pause();
        manager.pause();
        manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        manager.schedule_pass().await;

        assert!(manager.status().await.unwrap().is_paused);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);

        manager.resume();
        drain(&manager).await;
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_pending_jobs() {
        let (manager, store, _publisher, _clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;

        let job_id = manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        manager.cancel(job_id).await.unwrap();
        assert_eq!(store.find_job(job_id).await.unwrap().unwrap().status, JobStatus::Cancelled);

        assert!(matches!(
            manager.cancel(job_id).await,
            Err(QueueError::InvalidState { status: JobStatus::Cancelled, .. })
        ));
        assert!(matches!(manager.cancel(JobId::new()).await, Err(QueueError::NotFound { .. })));
    }

    #[tokio::test]
    async fn job_being_cancelled_holds_no_slot_and_is_not_dispatched() {
        let (manager, store, publisher, _clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;
        let job_id = manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();

        manager.state().cancelling.insert(job_id);
        manager.schedule_pass().await;

        let status = manager.status().await.unwrap();
        assert!(!status.is_processing);
        assert_eq!(status.counts.pending, 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            manager.cancel(job_id).await,
            Err(QueueError::InvalidState { .. })
        ));

        manager.state().cancelling.remove(&job_id);
        drain(&manager).await;
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert!(manager.state().cancelling.is_empty());
    }

    #[tokio::test]
    async fn retry_item_requires_failed_job() {
        let (manager, store, _publisher, _clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;

        let job_id = manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        assert!(matches!(
            manager.retry_item(job_id).await,
            Err(QueueError::InvalidState { expected: JobStatus::Failed, .. })
        ));
        assert!(matches!(manager.retry_item(JobId::new()).await, Err(QueueError::NotFound { .. })));
    }

    #[tokio::test]
    async fn status_reports_progress() {
        let (manager, store, _publisher, _clock) = setup().await;

        let empty = manager.status().await.unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.progress.abs() < f64::EPSILON);

        let (item_id, destination_id) = seed(&store).await;
        manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        let (other_item, other_destination) = seed(&store).await;
        manager.enqueue(other_item, other_destination, Priority::Normal).await.unwrap();
        drain(&manager).await;

        let (third_item, third_destination) = seed(&store).await;
        manager.enqueue(third_item, third_destination, Priority::Normal).await.unwrap();
        manager.pause();

        let status = manager.status().await.unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.counts.completed, 2);
        assert!((status.progress - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn purge_keeps_recent_and_unfinished_jobs() {
        let (manager, store, _publisher, clock) = setup().await;
        let (item_id, destination_id) = seed(&store).await;
        manager.enqueue(item_id, destination_id, Priority::Normal).await.unwrap();
        drain(&manager).await;

        let (pending_item, pending_destination) = seed(&store).await;
        manager.enqueue(pending_item, pending_destination, Priority::Normal).await.unwrap();

        assert_eq!(manager.purge_finished(Duration::from_secs(3600)).await.unwrap(), 0);

        clock.advance(Duration::from_secs(7200));
        assert_eq!(manager.purge_finished(Duration::from_secs(3600)).await.unwrap(), 1);
        assert_eq!(store.jobs().await.len(), 1);
    }

    #[test]
    fn saturating_sub_never_panics() {
        let now = Utc::now();
        assert_eq!(saturating_sub(now, Duration::ZERO), now);
        assert_eq!(saturating_sub(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
