//! Store contracts consumed by the queue manager.
//!
//! The queue manager talks to three narrow traits rather than a concrete
//! database, so the scheduler can be tested without I/O and embedded hosts
//! can plug in their own persistence. [`SqliteDeliveryStorage`] adapts the
//! repositories in `courier_core::storage`; [`memory::InMemoryStorage`] keeps
//! everything in process.
//!
//! Every operation is atomic for the job, item or destination it touches.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{
        ContentItem, ContentItemId, ContentUpdate, DeliveryJob, Destination, DestinationId, JobId,
        JobStatus, JobUpdate, StatusCounts,
    },
    Storage,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable table of delivery jobs.
pub trait JobStore: Send + Sync + 'static {
    /// Persists a new job.
    ///
    /// Fails with `ConstraintViolation` if an active job exists for the same
    /// (content item, destination) pair.
    fn insert_job(&self, job: DeliveryJob) -> StoreFuture<'_, ()>;

    /// Loads a job.
    fn find_job(&self, id: JobId) -> StoreFuture<'_, Option<DeliveryJob>>;

    /// Applies a partial update. Fails with `NotFound` for unknown ids.
    fn update_job(&self, id: JobId, update: JobUpdate) -> StoreFuture<'_, ()>;

    /// Deletes a job that is not processing. Returns `false` if absent.
    fn delete_job(&self, id: JobId) -> StoreFuture<'_, bool>;

    /// All jobs in `status`, highest priority then oldest first.
    fn find_jobs_by_status(&self, status: JobStatus) -> StoreFuture<'_, Vec<DeliveryJob>>;

    /// Number of jobs per status.
    fn status_counts(&self) -> StoreFuture<'_, StatusCounts>;

    /// Up to `limit` pending jobs whose `scheduled_for` is unset or not after
    /// `now`, in dispatch order.
    fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<DeliveryJob>>;

    /// Moves a pending job to processing. Returns `false` if it was not
    /// pending.
    fn claim_job(&self, id: JobId, started_at: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// The pending or processing job for a pair, if any.
    fn find_active_job(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> StoreFuture<'_, Option<DeliveryJob>>;

    /// The most recent completed, non-skipped job for a pair, if any.
    fn find_delivered_job(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> StoreFuture<'_, Option<DeliveryJob>>;

    /// Processing jobs whose attempt started at or before `started_before`.
    fn find_stale_jobs(&self, started_before: DateTime<Utc>) -> StoreFuture<'_, Vec<DeliveryJob>>;

    /// Deletes completed and cancelled jobs finished before `cutoff`.
    fn purge_finished_jobs(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

/// Captured content items.
pub trait ContentStore: Send + Sync + 'static {
    /// Persists a captured item.
    fn insert_content_item(&self, item: ContentItem) -> StoreFuture<'_, ()>;

    /// Loads an item.
    fn find_content_item(&self, id: ContentItemId) -> StoreFuture<'_, Option<ContentItem>>;

    /// Writes publish outcome fields.
    fn update_content_item(&self, id: ContentItemId, update: ContentUpdate)
        -> StoreFuture<'_, ()>;
}

/// Configured destinations.
pub trait DestinationStore: Send + Sync + 'static {
    /// Persists a destination.
    fn insert_destination(&self, destination: Destination) -> StoreFuture<'_, ()>;

    /// Loads a destination.
    fn find_destination(&self, id: DestinationId) -> StoreFuture<'_, Option<Destination>>;

    /// All destinations.
    fn list_destinations(&self) -> StoreFuture<'_, Vec<Destination>>;

    /// Bumps `total_published` and sets `last_sync`.
    fn record_published(&self, id: DestinationId, at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Bumps `failed_count`.
    fn record_failure(&self, id: DestinationId) -> StoreFuture<'_, ()>;
}

/// Production storage backed by the SQLite repositories.
#[derive(Debug, Clone)]
pub struct SqliteDeliveryStorage {
    storage: Arc<Storage>,
}

impl SqliteDeliveryStorage {
    /// Creates a new adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// The wrapped repositories.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

impl JobStore for SqliteDeliveryStorage {
    fn insert_job(&self, job: DeliveryJob) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.delivery_jobs.insert(&job).await })
    }

    fn find_job(&self, id: JobId) -> StoreFuture<'_, Option<DeliveryJob>> {
        Box::pin(self.storage.delivery_jobs.find(id))
    }

    fn update_job(&self, id: JobId, update: JobUpdate) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.delivery_jobs.update(id, &update).await })
    }

    fn delete_job(&self, id: JobId) -> StoreFuture<'_, bool> {
        Box::pin(self.storage.delivery_jobs.delete(id))
    }

    fn find_jobs_by_status(&self, status: JobStatus) -> StoreFuture<'_, Vec<DeliveryJob>> {
        Box::pin(self.storage.delivery_jobs.find_by_status(status))
    }

    fn status_counts(&self) -> StoreFuture<'_, StatusCounts> {
        Box::pin(self.storage.delivery_jobs.status_counts())
    }

    fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<DeliveryJob>> {
        Box::pin(self.storage.delivery_jobs.find_dispatchable(now, limit))
    }

    fn claim_job(&self, id: JobId, started_at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(self.storage.delivery_jobs.claim(id, started_at))
    }

    fn find_active_job(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> StoreFuture<'_, Option<DeliveryJob>> {
        Box::pin(self.storage.delivery_jobs.find_active_for_pair(content_item_id, destination_id))
    }

    fn find_delivered_job(
        &self,
        content_item_id: ContentItemId,
        destination_id: DestinationId,
    ) -> StoreFuture<'_, Option<DeliveryJob>> {
        Box::pin(
            self.storage.delivery_jobs.find_delivered_for_pair(content_item_id, destination_id),
        )
    }

    fn find_stale_jobs(&self, started_before: DateTime<Utc>) -> StoreFuture<'_, Vec<DeliveryJob>> {
        Box::pin(self.storage.delivery_jobs.find_stale_processing(started_before))
    }

    fn purge_finished_jobs(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(self.storage.delivery_jobs.purge_finished_before(cutoff))
    }
}

impl ContentStore for SqliteDeliveryStorage {
    fn insert_content_item(&self, item: ContentItem) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.content_items.insert(&item).await })
    }

    fn find_content_item(&self, id: ContentItemId) -> StoreFuture<'_, Option<ContentItem>> {
        Box::pin(self.storage.content_items.find(id))
    }

    fn update_content_item(
        &self,
        id: ContentItemId,
        update: ContentUpdate,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.content_items.update(id, &update).await })
    }
}

impl DestinationStore for SqliteDeliveryStorage {
    fn insert_destination(&self, destination: Destination) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.destinations.insert(&destination).await })
    }

    fn find_destination(&self, id: DestinationId) -> StoreFuture<'_, Option<Destination>> {
        Box::pin(self.storage.destinations.find(id))
    }

    fn list_destinations(&self) -> StoreFuture<'_, Vec<Destination>> {
        Box::pin(self.storage.destinations.list())
    }

    fn record_published(&self, id: DestinationId, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(self.storage.destinations.record_published(id, at))
    }

    fn record_failure(&self, id: DestinationId) -> StoreFuture<'_, ()> {
        Box::pin(self.storage.destinations.record_failure(id))
    }
}

pub mod memory {
    //! In-process storage.
    //!
    //! Keeps jobs, items and destinations behind a single lock so every
    //! operation is atomic. Supports injecting a failure into the next
    //! operation and records the peak number of simultaneously processing
    //! jobs for concurrency assertions.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{
            ContentItem, ContentItemId, ContentUpdate, DeliveryJob, Destination, DestinationId,
            JobId, JobStatus, JobUpdate, StatusCounts,
        },
    };
    use tokio::sync::{Mutex, RwLock};

    use super::{ContentStore, DestinationStore, JobStore, StoreFuture};

    #[derive(Debug, Default)]
    struct State {
        jobs: HashMap<JobId, (u64, DeliveryJob)>,
        next_seq: u64,
        content_items: HashMap<ContentItemId, ContentItem>,
        destinations: HashMap<DestinationId, (u64, Destination)>,
    }

    impl State {
        fn sorted_jobs<'a>(
            &'a self,
            filter: impl Fn(&DeliveryJob) -> bool + 'a,
        ) -> Vec<DeliveryJob> {
            let mut jobs: Vec<&(u64, DeliveryJob)> =
                self.jobs.values().filter(|(_, job)| filter(job)).collect();
            jobs.sort_by(|(seq_a, a), (seq_b, b)| a.dispatch_order(b).then(seq_a.cmp(seq_b)));
            jobs.into_iter().map(|(_, job)| job.clone()).collect()
        }

        fn processing_count(&self) -> usize {
            self.jobs.values().filter(|(_, job)| job.status == JobStatus::Processing).count()
        }
    }

    /// In-memory store implementing all three store contracts.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryStorage {
        state: Arc<RwLock<State>>,
        injected_error: Arc<Mutex<Option<String>>>,
        peak_processing: Arc<AtomicUsize>,
    }

    impl InMemoryStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next store operation fail with a database error.
        pub async fn inject_error(&self, message: impl Into<String>) {
            *self.injected_error.lock().await = Some(message.into());
        }

        /// Snapshot of every job, in dispatch order.
        pub async fn jobs(&self) -> Vec<DeliveryJob> {
            self.state.read().await.sorted_jobs(|_| true)
        }

        /// Highest number of jobs that were processing at the same time.
        pub fn peak_processing(&self) -> usize {
            self.peak_processing.load(Ordering::Acquire)
        }

        async fn take_injected(&self) -> Result<()> {
            match self.injected_error.lock().await.take() {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }
    }

    impl JobStore for InMemoryStorage {
        fn insert_job(&self, job: DeliveryJob) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;

                if job.status.is_active() {
                    let clash = state.jobs.values().any(|(_, existing)| {
                        existing.status.is_active()
                            && existing.content_item_id == job.content_item_id
                            && existing.destination_id == job.destination_id
                    });
                    if clash {
                        return Err(CoreError::ConstraintViolation(format!(
                            "active job exists for content {} and destination {}",
                            job.content_item_id, job.destination_id
                        )));
                    }
                }
                if state.jobs.contains_key(&job.id) {
                    return Err(CoreError::ConstraintViolation(format!("job {} exists", job.id)));
                }

                let seq = state.next_seq;
                state.next_seq += 1;
                state.jobs.insert(job.id, (seq, job));
                Ok(())
            })
        }

        fn find_job(&self, id: JobId) -> StoreFuture<'_, Option<DeliveryJob>> {
            Box::pin(async move {
                self.take_injected().await?;
                Ok(self.state.read().await.jobs.get(&id).map(|(_, job)| job.clone()))
            })
        }

        fn update_job(&self, id: JobId, update: JobUpdate) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                let (_, job) = state
                    .jobs
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
                update.apply(job);
                Ok(())
            })
        }

        fn delete_job(&self, id: JobId) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                match state.jobs.get(&id) {
                    None => Ok(false),
                    Some((_, job)) if job.status == JobStatus::Processing => {
                        Err(CoreError::ConstraintViolation(format!(
                            "job {id} is processing and cannot be deleted"
                        )))
                    },
                    Some(_) => {
                        state.jobs.remove(&id);
                        Ok(true)
                    },
                }
            })
        }

        fn find_jobs_by_status(&self, status: JobStatus) -> StoreFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                self.take_injected().await?;
                Ok(self.state.read().await.sorted_jobs(move |job| job.status == status))
            })
        }

        fn status_counts(&self) -> StoreFuture<'_, StatusCounts> {
            Box::pin(async move {
                self.take_injected().await?;
                let state = self.state.read().await;
                let mut counts = StatusCounts::default();
                for (_, job) in state.jobs.values() {
                    counts.add(job.status, 1);
                }
                Ok(counts)
            })
        }

        fn find_dispatchable(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StoreFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut due = self.state.read().await.sorted_jobs(move |job| job.is_dispatchable(now));
                due.truncate(limit);
                Ok(due)
            })
        }

        fn claim_job(&self, id: JobId, started_at: DateTime<Utc>) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                let claimed = match state.jobs.get_mut(&id) {
                    Some((_, job)) if job.status == JobStatus::Pending => {
                        job.status = JobStatus::Processing;
                        job.started_at = Some(started_at);
                        true
                    },
                    _ => false,
                };
                if claimed {
                    self.peak_processing.fetch_max(state.processing_count(), Ordering::AcqRel);
                }
                Ok(claimed)
            })
        }

        fn find_active_job(
            &self,
            content_item_id: ContentItemId,
            destination_id: DestinationId,
        ) -> StoreFuture<'_, Option<DeliveryJob>> {
            Box::pin(async move {
                self.take_injected().await?;
                let state = self.state.read().await;
                Ok(state
                    .jobs
                    .values()
                    .map(|(_, job)| job)
                    .find(|job| {
                        job.status.is_active()
                            && job.content_item_id == content_item_id
                            && job.destination_id == destination_id
                    })
                    .cloned())
            })
        }

        fn find_delivered_job(
            &self,
            content_item_id: ContentItemId,
            destination_id: DestinationId,
        ) -> StoreFuture<'_, Option<DeliveryJob>> {
            Box::pin(async move {
                self.take_injected().await?;
                let state = self.state.read().await;
                Ok(state
                    .jobs
                    .values()
                    .filter(|(_, job)| {
                        job.is_delivered()
                            && job.content_item_id == content_item_id
                            && job.destination_id == destination_id
                    })
                    .max_by_key(|(seq, job)| (job.completed_at, *seq))
                    .map(|(_, job)| job.clone()))
            })
        }

        fn find_stale_jobs(
            &self,
            started_before: DateTime<Utc>,
        ) -> StoreFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                self.take_injected().await?;
                Ok(self.state.read().await.sorted_jobs(move |job| {
                    job.status == JobStatus::Processing
                        && job.started_at.map_or(true, |at| at <= started_before)
                }))
            })
        }

        fn purge_finished_jobs(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                let before = state.jobs.len();
                state.jobs.retain(|_, (_, job)| {
                    let finished =
                        matches!(job.status, JobStatus::Completed | JobStatus::Cancelled);
                    !(finished && job.completed_at.is_some_and(|at| at < cutoff))
                });
                Ok((before - state.jobs.len()) as u64)
            })
        }
    }

    impl ContentStore for InMemoryStorage {
        fn insert_content_item(&self, item: ContentItem) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                if state.content_items.contains_key(&item.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "content item {} exists",
                        item.id
                    )));
                }
                state.content_items.insert(item.id, item);
                Ok(())
            })
        }

        fn find_content_item(&self, id: ContentItemId) -> StoreFuture<'_, Option<ContentItem>> {
            Box::pin(async move {
                self.take_injected().await?;
                Ok(self.state.read().await.content_items.get(&id).cloned())
            })
        }

        fn update_content_item(
            &self,
            id: ContentItemId,
            update: ContentUpdate,
        ) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                let item = state
                    .content_items
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("content item {id}")))?;
                update.apply(item);
                Ok(())
            })
        }
    }

    impl DestinationStore for InMemoryStorage {
        fn insert_destination(&self, destination: Destination) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                if state.destinations.contains_key(&destination.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "destination {} exists",
                        destination.id
                    )));
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                state.destinations.insert(destination.id, (seq, destination));
                Ok(())
            })
        }

        fn find_destination(&self, id: DestinationId) -> StoreFuture<'_, Option<Destination>> {
            Box::pin(async move {
                self.take_injected().await?;
                Ok(self.state.read().await.destinations.get(&id).map(|(_, d)| d.clone()))
            })
        }

        fn list_destinations(&self) -> StoreFuture<'_, Vec<Destination>> {
            Box::pin(async move {
                self.take_injected().await?;
                let state = self.state.read().await;
                let mut destinations: Vec<&(u64, Destination)> =
                    state.destinations.values().collect();
                destinations.sort_by_key(|(seq, _)| *seq);
                Ok(destinations.into_iter().map(|(_, d)| d.clone()).collect())
            })
        }

        fn record_published(&self, id: DestinationId, at: DateTime<Utc>) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                let (_, destination) = state
                    .destinations
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("destination {id}")))?;
                destination.stats.total_published += 1;
                destination.last_sync = Some(at);
                Ok(())
            })
        }

        fn record_failure(&self, id: DestinationId) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.take_injected().await?;
                let mut state = self.state.write().await;
                let (_, destination) = state
                    .destinations
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("destination {id}")))?;
                destination.stats.failed_count += 1;
                Ok(())
            })
        }
    }
}
