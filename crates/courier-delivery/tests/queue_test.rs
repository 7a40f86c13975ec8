//! Integration tests for the queue manager.
//!
//! Drives the scheduler through the test harness: scripted publisher
//! outcomes, an in-memory store and a controllable clock.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use courier_core::{
    ContentItemId, ContentStatus, DeliveryJob, DestinationId, JobStatus, NotificationKind, Priority,
};
use courier_delivery::{
    ConflictPolicy, DeliveryError, JobStore, PublishContext, QueueError, RetryPolicy,
};
use courier_testing::{
    wait_until, Clock, ContentItemBuilder, DestinationBuilder, ScriptedPublisher, TestEnv,
};

#[tokio::test]
async fn never_exceeds_max_concurrent() {
    let env = TestEnv::builder().max_concurrent(2).publisher(ScriptedPublisher::gated()).build();
    for _ in 0..5 {
        env.enqueue_new(Priority::Normal).await.unwrap();
    }

    env.queue.schedule_pass().await;
    wait_until(Duration::from_secs(1), || async { env.publisher.started() == 2 }).await.unwrap();

    let status = env.queue.status().await.unwrap();
    assert_eq!(status.counts.processing, 2);
    assert_eq!(status.counts.pending, 3);
    assert!(status.is_processing);

    env.publisher.release(5);
    env.run_until_idle().await.unwrap();

    assert_eq!(env.jobs_with_status(JobStatus::Completed).await.unwrap().len(), 5);
    assert_eq!(env.storage.peak_processing(), 2);
}

async fn enqueue_seeded(env: &TestEnv, priority: Priority) -> ContentItemId {
    let (item, destination) = env.seed_pair().await.unwrap();
    env.queue.enqueue(item.id, destination.id, priority).await.unwrap();
    env.advance_time(Duration::from_millis(10));
    item.id
}

#[tokio::test]
async fn dispatches_by_priority_then_age() {
    let env = TestEnv::builder().max_concurrent(1).build();

    let low = enqueue_seeded(&env, Priority::Low).await;
    let normal_first = enqueue_seeded(&env, Priority::Normal).await;
    let urgent = enqueue_seeded(&env, Priority::Urgent).await;
    let normal_second = enqueue_seeded(&env, Priority::Normal).await;
    let high = enqueue_seeded(&env, Priority::High).await;

    env.run_until_idle().await.unwrap();

    let order: Vec<_> = env.publisher.calls().into_iter().map(|c| c.content_item_id).collect();
    assert_eq!(order, vec![urgent, high, normal_first, normal_second, low]);
}

#[tokio::test]
async fn successful_delivery_updates_item_destination_and_notifies() {
    let env = TestEnv::new();
    env.publisher.succeed_with("99");

    let item =
        env.create_content_item(ContentItemBuilder::new().title("Field notes")).await.unwrap();
    let destination =
        env.create_destination(DestinationBuilder::new().name("Blog")).await.unwrap();
    let job_id = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();

    env.run_until_idle().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert!(job.last_error.is_none());

    let item = env.content_item(item.id).await.unwrap();
    assert_eq!(item.status, ContentStatus::Published);
    assert_eq!(item.remote_id.as_deref(), Some("99"));
    assert_eq!(item.published_url.as_deref(), Some("https://remote.example/99"));
    assert_eq!(item.destination_id, Some(destination.id));

    let destination = env.destination(destination.id).await.unwrap();
    assert_eq!(destination.stats.total_published, 1);
    assert!(destination.last_sync.is_some());

    let notes = env.notifier.of_kind(NotificationKind::Success);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].job_id, job_id);
    assert!(notes[0].message.contains("Field notes"));
    assert!(notes[0].message.contains("Blog"));
}

#[tokio::test]
async fn non_retryable_failure_fails_after_one_attempt() {
    let env = TestEnv::new();
    env.publisher.push(Err(DeliveryError::client_error(422, "invalid post")));

    let (item, destination) = env.seed_pair().await.unwrap();
    let job_id = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(job.last_error.unwrap().contains("422"));
    assert_eq!(env.publisher.call_count(), 1);

    let item = env.content_item(item.id).await.unwrap();
    assert_eq!(item.status, ContentStatus::Failed);
    assert!(item.error.is_some());

    assert_eq!(env.destination(destination.id).await.unwrap().stats.failed_count, 1);
    assert_eq!(env.notifier.of_kind(NotificationKind::Failure).len(), 1);
}

#[tokio::test]
async fn exhausted_retry_budget_fails_job() {
    let env = TestEnv::builder().max_retries(2).build();
    env.publisher.fail_times(3, DeliveryError::server_error(500, "boom"));

    let job_id = env.enqueue_new(Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(env.publisher.call_count(), 3);
    assert!(env.notifier.of_kind(NotificationKind::Success).is_empty());
}

#[tokio::test]
async fn backed_off_job_waits_for_its_schedule() {
    let env = TestEnv::new();
    env.publisher.push(Err(DeliveryError::timeout(30)));

    let job_id = env.enqueue_new(Priority::Normal).await.unwrap();
    env.queue.schedule_pass().await;
    env.wait_for_in_flight().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.scheduled_for, Some(env.clock.now() + ChronoDuration::seconds(2)));

    env.queue.schedule_pass().await;
    env.wait_for_in_flight().await.unwrap();
    assert_eq!(env.publisher.call_count(), 1);

    env.advance_time(Duration::from_secs(2));
    env.queue.schedule_pass().await;
    env.wait_for_in_flight().await.unwrap();
    assert_eq!(env.publisher.call_count(), 2);
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn rate_limit_hint_extends_backoff() {
    let env = TestEnv::new();
    env.publisher.push(Err(DeliveryError::rate_limited(120)));

    let job_id = env.enqueue_new(Priority::Normal).await.unwrap();
    env.queue.schedule_pass().await;
    env.wait_for_in_flight().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.scheduled_for, Some(env.clock.now() + ChronoDuration::seconds(120)));
}

#[tokio::test]
async fn disabled_destination_fails_without_publishing() {
    let env = TestEnv::new();
    let item = env.create_content_item(ContentItemBuilder::new()).await.unwrap();
    let destination = env.create_destination(DestinationBuilder::new().disabled()).await.unwrap();

    let job_id = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(job.last_error.unwrap().contains("disabled"));
    assert_eq!(env.publisher.call_count(), 0);
}

#[tokio::test]
async fn skip_policy_completes_without_publishing() {
    let env = TestEnv::new();
    let destination = env.create_destination(DestinationBuilder::new()).await.unwrap();
    let item = env
        .create_content_item(ContentItemBuilder::new().published_to(
            destination.id,
            "42",
            Some("https://blog.example/42"),
        ))
        .await
        .unwrap();

    let job_id = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.skipped_reason.unwrap().contains("42"));
    assert_eq!(env.publisher.call_count(), 0);
    assert_eq!(env.destination(destination.id).await.unwrap().stats.total_published, 0);
}

#[tokio::test]
async fn overwrite_policy_passes_existing_remote_id() {
    let env = TestEnv::builder().conflict_policy(ConflictPolicy::Overwrite).build();
    let destination = env.create_destination(DestinationBuilder::new()).await.unwrap();
    let item = env
        .create_content_item(ContentItemBuilder::new().published_to(destination.id, "42", None))
        .await
        .unwrap();

    env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let calls = env.publisher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].context, PublishContext { existing_remote_id: Some("42".to_string()) });
}

#[tokio::test]
async fn create_new_policy_publishes_fresh_copy() {
    let env = TestEnv::builder().conflict_policy(ConflictPolicy::CreateNew).build();
    env.publisher.succeed_with("43");
    let destination = env.create_destination(DestinationBuilder::new()).await.unwrap();
    let item = env
        .create_content_item(ContentItemBuilder::new().published_to(destination.id, "42", None))
        .await
        .unwrap();

    env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    assert_eq!(env.publisher.calls()[0].context, PublishContext::default());
    let item = env.content_item(item.id).await.unwrap();
    assert_eq!(item.remote_id.as_deref(), Some("43"));
}

#[tokio::test]
async fn delivery_is_remembered_after_publishing_to_another_destination() {
    let env = TestEnv::new();
    env.publisher.succeed_with("d1-post");
    env.publisher.succeed_with("d2-post");

    let item = env.create_content_item(ContentItemBuilder::new()).await.unwrap();
    let first = env.create_destination(DestinationBuilder::new()).await.unwrap();
    let second = env.create_destination(DestinationBuilder::new()).await.unwrap();

    env.queue.enqueue(item.id, first.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();
    env.queue.enqueue(item.id, second.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();
    assert_eq!(env.content_item(item.id).await.unwrap().destination_id, Some(second.id));

    let again = env.queue.enqueue(item.id, first.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(again).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.skipped_reason.unwrap().contains("d1-post"));
    assert_eq!(env.publisher.call_count(), 2);
}

#[tokio::test]
async fn delivery_is_remembered_after_failing_elsewhere() {
    let env = TestEnv::new();
    env.publisher.succeed_with("d1-post");
    env.publisher.push(Err(DeliveryError::client_error(404, "no such site")));

    let item = env.create_content_item(ContentItemBuilder::new()).await.unwrap();
    let first = env.create_destination(DestinationBuilder::new()).await.unwrap();
    let second = env.create_destination(DestinationBuilder::new()).await.unwrap();

    env.queue.enqueue(item.id, first.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();
    let failed = env.queue.enqueue(item.id, second.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();
    assert_eq!(env.job(failed).await.unwrap().status, JobStatus::Failed);
    assert_eq!(env.content_item(item.id).await.unwrap().status, ContentStatus::Failed);

    let again = env.queue.enqueue(item.id, first.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(again).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.skipped_reason.is_some());
    assert_eq!(env.publisher.call_count(), 2);
}

#[tokio::test]
async fn overwrite_uses_remote_id_of_earlier_delivery() {
    let env = TestEnv::builder().conflict_policy(ConflictPolicy::Overwrite).build();
    env.publisher.succeed_with("d1-post");
    env.publisher.succeed_with("d2-post");

    let item = env.create_content_item(ContentItemBuilder::new()).await.unwrap();
    let first = env.create_destination(DestinationBuilder::new()).await.unwrap();
    let second = env.create_destination(DestinationBuilder::new()).await.unwrap();

    for destination in [first.id, second.id, first.id] {
        env.queue.enqueue(item.id, destination, Priority::Normal).await.unwrap();
        env.run_until_idle().await.unwrap();
    }

    let calls = env.publisher.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].context, PublishContext { existing_remote_id: Some("d1-post".into()) });
}

#[tokio::test]
async fn enqueue_default_targets_enabled_default_destinations() {
    let env = TestEnv::new();
    let item = env.create_content_item(ContentItemBuilder::new()).await.unwrap();
    let first = env.create_destination(DestinationBuilder::new().default_target()).await.unwrap();
    let second = env.create_destination(DestinationBuilder::new().default_target()).await.unwrap();
    env.create_destination(DestinationBuilder::new()).await.unwrap();
    env.create_destination(DestinationBuilder::new().default_target().disabled()).await.unwrap();

    let created = env.queue.enqueue_default(item.id, Priority::High).await.unwrap();
    assert_eq!(created.len(), 2);

    let mut targets = Vec::new();
    for job_id in &created {
        let job = env.job(*job_id).await.unwrap();
        assert_eq!(job.priority, Priority::High);
        targets.push(job.destination_id);
    }
    targets.sort_by_key(|id| id.0);
    let mut expected = vec![first.id, second.id];
    expected.sort_by_key(|id| id.0);
    assert_eq!(targets, expected);

    let again = env.queue.enqueue_default(item.id, Priority::High).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn recovery_sweep_requeues_stale_processing_jobs() {
    let env = TestEnv::new();
    let (item, destination) = env.seed_pair().await.unwrap();

    let mut job = DeliveryJob::new(item.id, destination.id, Priority::Normal, 3, env.clock.now());
    job.status = JobStatus::Processing;
    job.started_at = Some(env.clock.now());
    let job_id = job.id;
    env.storage.insert_job(job).await.unwrap();

    assert_eq!(env.queue.recover_stale_jobs().await.unwrap(), 0);

    env.advance_time(Duration::from_secs(61));
    assert_eq!(env.queue.recover_stale_jobs().await.unwrap(), 1);

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.last_error.unwrap().contains("interrupted"));

    env.run_until_idle().await.unwrap();
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn recovery_fails_jobs_without_budget() {
    let env = TestEnv::new();
    let (item, destination) = env.seed_pair().await.unwrap();

    let mut job = DeliveryJob::new(item.id, destination.id, Priority::Normal, 2, env.clock.now());
    job.status = JobStatus::Processing;
    job.retry_count = 2;
    job.started_at = Some(env.clock.now());
    let job_id = job.id;
    env.storage.insert_job(job).await.unwrap();

    env.advance_time(Duration::from_secs(120));
    assert_eq!(env.queue.recover_stale_jobs().await.unwrap(), 1);

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(env.content_item(item.id).await.unwrap().status, ContentStatus::Failed);
    assert_eq!(env.notifier.of_kind(NotificationKind::Failure).len(), 1);
}

#[tokio::test]
async fn recovery_ignores_jobs_in_flight_here() {
    let env = TestEnv::builder().publisher(ScriptedPublisher::gated()).build();
    let job_id = env.enqueue_new(Priority::Normal).await.unwrap();

    env.queue.schedule_pass().await;
    wait_until(Duration::from_secs(1), || async { env.publisher.started() == 1 }).await.unwrap();

    env.advance_time(Duration::from_secs(600));
    assert_eq!(env.queue.recover_stale_jobs().await.unwrap(), 0);
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Processing);

    env.publisher.release(1);
    env.wait_for_in_flight().await.unwrap();
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn start_recovers_orphans_and_dispatches() {
    let env = TestEnv::new();
    let (item, destination) = env.seed_pair().await.unwrap();

    let mut orphan =
        DeliveryJob::new(item.id, destination.id, Priority::Normal, 3, env.clock.now());
    orphan.status = JobStatus::Processing;
    orphan.started_at = Some(env.clock.now());
    let orphan_id = orphan.id;
    env.storage.insert_job(orphan).await.unwrap();

    let fresh = env.enqueue_new(Priority::Normal).await.unwrap();

    assert_eq!(env.queue.start().await.unwrap(), 1);
    assert_eq!(env.queue.start().await.unwrap(), 0);

    wait_until(Duration::from_secs(5), || async {
        let orphan = env.job(orphan_id).await.unwrap();
        let fresh = env.job(fresh).await.unwrap();
        orphan.status == JobStatus::Completed && fresh.status == JobStatus::Completed
    })
    .await
    .unwrap();

    assert_eq!(env.job(orphan_id).await.unwrap().retry_count, 1);
    assert!(env.queue.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn shutdown_stops_dispatching() {
    let env = TestEnv::new();
    env.queue.start().await.unwrap();
    assert!(env.queue.shutdown(Duration::from_secs(1)).await);

    let job_id = env.enqueue_new(Priority::Normal).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Pending);
    assert_eq!(env.publisher.call_count(), 0);
}

#[tokio::test]
async fn retry_all_failed_leaves_pairs_with_active_jobs() {
    let env = TestEnv::new();
    env.publisher.push(Err(DeliveryError::not_found("post")));

    let (item, destination) = env.seed_pair().await.unwrap();
    let failed = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();
    assert_eq!(env.job(failed).await.unwrap().status, JobStatus::Failed);

    env.queue.pause();
    let active = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();

    assert_eq!(env.queue.retry_all_failed().await.unwrap(), 0);
    assert_eq!(env.job(failed).await.unwrap().status, JobStatus::Failed);

    match env.queue.retry_item(failed).await {
        Err(QueueError::DuplicateJob { existing }) => assert_eq!(existing, active),
        other => panic!("expected duplicate job error, got {other:?}"),
    }
}

#[tokio::test]
async fn retry_item_resets_budget_and_content_state() {
    let env = TestEnv::builder().retry_policy(RetryPolicy::immediate(1)).build();
    env.publisher.fail_times(2, DeliveryError::server_error(502, "bad gateway"));

    let (item, destination) = env.seed_pair().await.unwrap();
    let job_id = env.queue.enqueue(item.id, destination.id, Priority::Normal).await.unwrap();
    env.run_until_idle().await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(env.content_item(item.id).await.unwrap().status, ContentStatus::Failed);

    env.queue.retry_item(job_id).await.unwrap();

    let job = env.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.last_error.is_none());
    let reset = env.content_item(item.id).await.unwrap();
    assert_eq!(reset.status, ContentStatus::Pending);
    assert!(reset.error.is_none());

    env.run_until_idle().await.unwrap();
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_destination_reports_reachability() {
    let env = TestEnv::builder().publisher(ScriptedPublisher::unreachable()).build();
    let destination = env.create_destination(DestinationBuilder::new()).await.unwrap();

    assert!(!env.queue.test_destination(destination.id).await.unwrap());

    let missing = DestinationId::new();
    assert!(matches!(
        env.queue.test_destination(missing).await,
        Err(QueueError::NotFound { entity: "destination", .. })
    ));
}

#[tokio::test]
async fn store_failure_on_dispatch_leaves_job_pending() {
    let env = TestEnv::new();
    let job_id = env.enqueue_new(Priority::Normal).await.unwrap();

    env.storage.inject_error("database is locked").await;
    env.queue.schedule_pass().await;
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Pending);
    assert!(!env.queue.status().await.unwrap().is_processing);

    env.run_until_idle().await.unwrap();
    assert_eq!(env.job(job_id).await.unwrap().status, JobStatus::Completed);
}
