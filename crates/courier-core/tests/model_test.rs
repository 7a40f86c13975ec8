//! Property tests for job ordering and update semantics.

use chrono::{DateTime, Duration, Utc};
use courier_core::{
    ContentItemId, DeliveryJob, DestinationId, JobStatus, JobUpdate, Priority,
};
use proptest::prelude::*;

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

proptest! {
    #[test]
    fn dispatch_order_never_puts_lower_priority_first(
        specs in prop::collection::vec((priority(), 0i64..10_000), 1..40)
    ) {
        let mut jobs: Vec<DeliveryJob> = specs
            .iter()
            .map(|(priority, offset)| {
                DeliveryJob::new(
                    ContentItemId::new(),
                    DestinationId::new(),
                    *priority,
                    3,
                    base_time() + Duration::milliseconds(*offset),
                )
            })
            .collect();

        jobs.sort_by(DeliveryJob::dispatch_order);

        for pair in jobs.windows(2) {
            prop_assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
            }
        }
    }

    #[test]
    fn retry_update_always_returns_to_pending(retry_count in 0u32..50, delay_secs in 0i64..3600) {
        let mut job = DeliveryJob::new(
            ContentItemId::new(),
            DestinationId::new(),
            Priority::Normal,
            50,
            base_time(),
        );
        job.status = JobStatus::Processing;

        let at = base_time() + Duration::seconds(delay_secs);
        JobUpdate::retry_at(retry_count, "HTTP 500", at).apply(&mut job);

        prop_assert_eq!(job.status, JobStatus::Pending);
        prop_assert_eq!(job.retry_count, retry_count);
        prop_assert!(!job.is_dispatchable(at - Duration::milliseconds(1)));
        prop_assert!(job.is_dispatchable(at));
    }
}
