//! Integration tests for the SQLite repositories.
//!
//! Runs every repository operation against a private in-memory database and
//! checks the rows read back match what the queue engine relies on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{
    models::{
        AuthConfig, ContentItem, ContentStatus, ContentUpdate, DeliveryJob, Destination,
        DestinationId, DestinationKind, JobStatus, JobUpdate, Priority,
    },
    Clock, CoreError, Storage, TestClock,
};

fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn storage() -> Storage {
    Storage::in_memory().await.unwrap()
}

#[tokio::test]
async fn storage_health_check() {
    let storage = storage().await;
    assert!(storage.health_check().await.is_ok());
}

#[tokio::test]
async fn content_item_round_trips_and_updates() {
    let storage = storage().await;
    let mut item = ContentItem::new("Saved thread", "# heading\n\nbody", start_time());
    item.tags = vec!["rust".to_string(), "queues".to_string()];
    item.metadata = serde_json::json!({"likes": 12});
    item.source_url = Some("https://social.example.com/status/1".to_string());

    storage.content_items.insert(&item).await.unwrap();
    let found = storage.content_items.find(item.id).await.unwrap().unwrap();
    assert_eq!(found, item);

    let destination = DestinationId::new();
    storage
        .content_items
        .update(
            item.id,
            &ContentUpdate::published(
                destination,
                Some("https://blog.example.com/?p=42".to_string()),
                Some("42".to_string()),
                start_time(),
            ),
        )
        .await
        .unwrap();

    let published = storage.content_items.find(item.id).await.unwrap().unwrap();
    assert_eq!(published.status, ContentStatus::Published);
    assert!(published.is_published_to(destination));
    assert_eq!(published.title, item.title);
}

#[tokio::test]
async fn updating_missing_content_item_is_not_found() {
    let storage = storage().await;
    let missing = ContentItem::new("missing", "", start_time());

    let err = storage.content_items.update(missing.id, &ContentUpdate::reset()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn destination_round_trips_with_kind_and_auth() {
    let storage = storage().await;
    let mut destination = Destination::new(
        "Team blog",
        DestinationKind::WordPress {
            site_url: "https://blog.example.com".to_string(),
            post_status: "draft".to_string(),
        },
        start_time(),
    );
    destination.auth = AuthConfig::Basic {
        username: "editor".to_string(),
        password: "app-password".to_string(),
    };
    destination.is_default = true;

    storage.destinations.insert(&destination).await.unwrap();

    let found = storage.destinations.find(destination.id).await.unwrap().unwrap();
    assert_eq!(found, destination);
    assert_eq!(storage.destinations.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn destination_counters_accumulate() {
    let storage = storage().await;
    let destination = Destination::new("local", DestinationKind::Local, start_time());
    storage.destinations.insert(&destination).await.unwrap();

    let sync_time = start_time() + chrono::Duration::minutes(5);
    storage.destinations.record_published(destination.id, sync_time).await.unwrap();
    storage.destinations.record_published(destination.id, sync_time).await.unwrap();
    storage.destinations.record_failure(destination.id).await.unwrap();
    storage.destinations.set_enabled(destination.id, false).await.unwrap();

    let found = storage.destinations.find(destination.id).await.unwrap().unwrap();
    assert_eq!(found.stats.total_published, 2);
    assert_eq!(found.stats.failed_count, 1);
    assert_eq!(found.last_sync, Some(sync_time));
    assert!(!found.enabled);

    let err = storage.destinations.record_failure(DestinationId::new()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn dispatchable_jobs_follow_priority_then_age() {
    let storage = storage().await;
    let clock = TestClock::with_start_time(start_time());

    let old_normal = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::Normal,
        3,
        clock.now(),
    );
    clock.advance(Duration::from_secs(1));
    let urgent = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::Urgent,
        3,
        clock.now(),
    );
    clock.advance(Duration::from_secs(1));
    let mut backed_off = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::Urgent,
        3,
        clock.now(),
    );
    backed_off.scheduled_for = Some(clock.now() + chrono::Duration::minutes(10));

    for job in [&old_normal, &urgent, &backed_off] {
        storage.delivery_jobs.insert(job).await.unwrap();
    }

    let due = storage.delivery_jobs.find_dispatchable(clock.now(), 10).await.unwrap();
    let ids: Vec<_> = due.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![urgent.id, old_normal.id]);

    clock.advance(Duration::from_secs(600));
    let due = storage.delivery_jobs.find_dispatchable(clock.now(), 1).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, backed_off.id);
}

#[tokio::test]
async fn claim_succeeds_only_once() {
    let storage = storage().await;
    let job = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::Normal,
        3,
        start_time(),
    );
    storage.delivery_jobs.insert(&job).await.unwrap();

    assert!(storage.delivery_jobs.claim(job.id, start_time()).await.unwrap());
    assert!(!storage.delivery_jobs.claim(job.id, start_time()).await.unwrap());

    let claimed = storage.delivery_jobs.find(job.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.started_at, Some(start_time()));
}

#[tokio::test]
async fn active_pair_is_unique() {
    let storage = storage().await;
    let content = courier_core::ContentItemId::new();
    let destination = DestinationId::new();

    let first = DeliveryJob::new(content, destination, Priority::Normal, 3, start_time());
    storage.delivery_jobs.insert(&first).await.unwrap();

    let duplicate = DeliveryJob::new(content, destination, Priority::High, 3, start_time());
    let err = storage.delivery_jobs.insert(&duplicate).await.unwrap_err();
    assert!(matches!(err, CoreError::ConstraintViolation(_)));

    let active = storage.delivery_jobs.find_active_for_pair(content, destination).await.unwrap();
    assert_eq!(active.map(|job| job.id), Some(first.id));

    storage.delivery_jobs.update(first.id, &JobUpdate::completed(start_time())).await.unwrap();
    assert!(storage
        .delivery_jobs
        .find_active_for_pair(content, destination)
        .await
        .unwrap()
        .is_none());
    storage.delivery_jobs.insert(&duplicate).await.unwrap();
}

#[tokio::test]
async fn delivered_lookup_returns_latest_publish_for_pair() {
    let storage = storage().await;
    let content = courier_core::ContentItemId::new();
    let destination = DestinationId::new();

    assert!(storage
        .delivery_jobs
        .find_delivered_for_pair(content, destination)
        .await
        .unwrap()
        .is_none());

    let first = DeliveryJob::new(content, destination, Priority::Normal, 3, start_time());
    storage.delivery_jobs.insert(&first).await.unwrap();
    let published = JobUpdate::published(
        Some("42".to_string()),
        Some("https://blog.example/42".to_string()),
        start_time(),
    );
    storage.delivery_jobs.update(first.id, &published).await.unwrap();

    let skipped = DeliveryJob::new(content, destination, Priority::Normal, 3, start_time());
    storage.delivery_jobs.insert(&skipped).await.unwrap();
    let later = start_time() + chrono::Duration::minutes(5);
    storage
        .delivery_jobs
        .update(skipped.id, &JobUpdate::skipped("already published", later))
        .await
        .unwrap();

    let other = DeliveryJob::new(content, DestinationId::new(), Priority::Normal, 3, later);
    storage.delivery_jobs.insert(&other).await.unwrap();
    storage
        .delivery_jobs
        .update(other.id, &JobUpdate::published(Some("7".to_string()), None, later))
        .await
        .unwrap();

    let delivered = storage
        .delivery_jobs
        .find_delivered_for_pair(content, destination)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.id, first.id);
    assert_eq!(delivered.remote_id.as_deref(), Some("42"));
    assert_eq!(delivered.published_url.as_deref(), Some("https://blog.example/42"));
}

#[tokio::test]
async fn partial_update_leaves_other_fields() {
    let storage = storage().await;
    let job = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::Low,
        5,
        start_time(),
    );
    storage.delivery_jobs.insert(&job).await.unwrap();

    let retry_at = start_time() + chrono::Duration::seconds(30);
    storage
        .delivery_jobs
        .update(job.id, &JobUpdate::retry_at(1, "HTTP 503", retry_at))
        .await
        .unwrap();

    let updated = storage.delivery_jobs.find(job.id).await.unwrap().unwrap();
    assert_eq!(updated.retry_count, 1);
    assert_eq!(updated.last_error.as_deref(), Some("HTTP 503"));
    assert_eq!(updated.scheduled_for, Some(retry_at));
    assert_eq!(updated.priority, Priority::Low);
    assert_eq!(updated.max_retries, 5);

    let err = storage
        .delivery_jobs
        .update(courier_core::JobId::new(), &JobUpdate::reset())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn processing_jobs_cannot_be_deleted() {
    let storage = storage().await;
    let job = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::Normal,
        3,
        start_time(),
    );
    storage.delivery_jobs.insert(&job).await.unwrap();
    storage.delivery_jobs.claim(job.id, start_time()).await.unwrap();

    let err = storage.delivery_jobs.delete(job.id).await.unwrap_err();
    assert!(matches!(err, CoreError::ConstraintViolation(_)));

    storage.delivery_jobs.update(job.id, &JobUpdate::completed(start_time())).await.unwrap();
    assert!(storage.delivery_jobs.delete(job.id).await.unwrap());
    assert!(!storage.delivery_jobs.delete(job.id).await.unwrap());
}

#[tokio::test]
async fn status_counts_and_stale_lookup() {
    let storage = storage().await;
    let now = start_time();

    let mut jobs = Vec::new();
    for _ in 0..4 {
        let job = DeliveryJob::new(
            courier_core::ContentItemId::new(),
            DestinationId::new(),
            Priority::Normal,
            3,
            now,
        );
        storage.delivery_jobs.insert(&job).await.unwrap();
        jobs.push(job);
    }

    storage.delivery_jobs.claim(jobs[0].id, now - chrono::Duration::minutes(10)).await.unwrap();
    storage.delivery_jobs.claim(jobs[1].id, now).await.unwrap();
    storage.delivery_jobs.update(jobs[2].id, &JobUpdate::failed("HTTP 404", now)).await.unwrap();

    let counts = storage.delivery_jobs.status_counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.processing, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 4);

    let stale = storage
        .delivery_jobs
        .find_stale_processing(now - chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, jobs[0].id);

    let failed = storage.delivery_jobs.find_by_status(JobStatus::Failed).await.unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn purge_removes_only_old_finished_jobs() {
    let storage = storage().await;
    let now = start_time();
    let long_ago = now - chrono::Duration::days(40);

    let mut ids = Vec::new();
    for _ in 0..4 {
        let job = DeliveryJob::new(
            courier_core::ContentItemId::new(),
            DestinationId::new(),
            Priority::Normal,
            3,
            long_ago,
        );
        storage.delivery_jobs.insert(&job).await.unwrap();
        ids.push(job.id);
    }

    storage.delivery_jobs.update(ids[0], &JobUpdate::completed(long_ago)).await.unwrap();
    storage.delivery_jobs.update(ids[1], &JobUpdate::cancelled(long_ago)).await.unwrap();
    storage.delivery_jobs.update(ids[2], &JobUpdate::failed("HTTP 401", long_ago)).await.unwrap();
    storage.delivery_jobs.update(ids[3], &JobUpdate::completed(now)).await.unwrap();

    let removed = storage
        .delivery_jobs
        .purge_finished_before(now - chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let counts = storage.delivery_jobs.status_counts().await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.completed, 1);
}

#[tokio::test]
async fn on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("courier.db").display());

    let job = DeliveryJob::new(
        courier_core::ContentItemId::new(),
        DestinationId::new(),
        Priority::High,
        3,
        start_time(),
    );

    {
        let storage = Storage::connect(&url, 2).await.unwrap();
        storage.delivery_jobs.insert(&job).await.unwrap();
        storage.delivery_jobs.claim(job.id, start_time()).await.unwrap();
        storage.close().await;
    }

    let reopened = Storage::connect(&url, 2).await.unwrap();
    let found = reopened.delivery_jobs.find(job.id).await.unwrap().unwrap();
    assert_eq!(found.status, JobStatus::Processing);
    assert_eq!(found.priority, Priority::High);
}
