//! Scripted publisher for driving the queue through chosen outcomes.
//!
//! Each publish call pops the next scripted result. When the script is
//! empty the publisher succeeds with a generated remote id. A gate makes
//! calls block until the test releases them, which keeps jobs in
//! `processing` for as long as a test needs.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use courier_core::{ContentItem, ContentItemId, Destination};
use courier_delivery::{
    DeliveryError, PublishContext, PublishOutcome, Publisher, PublisherFactory, Result,
};
use tokio::sync::Semaphore;

/// One recorded publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    /// Item that was published.
    pub content_item_id: ContentItemId,
    /// Context the queue passed.
    pub context: PublishContext,
}

/// Publisher that replays a script of results.
#[derive(Debug, Default)]
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Result<PublishOutcome>>>,
    calls: Mutex<Vec<PublishCall>>,
    started: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    reachable: bool,
}

impl ScriptedPublisher {
    /// A publisher that always succeeds.
    pub fn new() -> Self {
        Self { reachable: true, ..Self::default() }
    }

    /// A publisher whose calls wait for [`release`](Self::release).
    pub fn gated() -> Self {
        Self { gate: Some(Arc::new(Semaphore::new(0))), ..Self::new() }
    }

    /// A publisher whose connection test fails.
    pub fn unreachable() -> Self {
        Self { reachable: false, ..Self::default() }
    }

    /// Appends a result to the script.
    pub fn push(&self, result: Result<PublishOutcome>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(result);
    }

    /// Appends `count` failures with `error`.
    pub fn fail_times(&self, count: usize, error: DeliveryError) {
        for _ in 0..count {
            self.push(Err(error.clone()));
        }
    }

    /// Appends a success with the given remote id.
    pub fn succeed_with(&self, remote_id: impl Into<String>) {
        let remote_id = remote_id.into();
        self.push(Ok(PublishOutcome {
            published_url: Some(format!("https://remote.example/{remote_id}")),
            remote_id: Some(remote_id),
        }));
    }

    /// Lets `permits` gated calls proceed.
    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    /// Number of publish calls that started, including gated ones.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Completed publish calls in order.
    pub fn calls(&self) -> Vec<PublishCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of completed publish calls.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        context: &PublishContext,
    ) -> Result<PublishOutcome> {
        let call = self.started.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| DeliveryError::internal("publisher gate closed"))?;
            permit.forget();
        }

        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(PublishCall {
            content_item_id: item.id,
            context: context.clone(),
        });

        let scripted = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PublishOutcome {
                published_url: Some(format!("https://remote.example/posts/{call}")),
                remote_id: Some(call.to_string()),
            })
        })
    }

    async fn test_connection(&self) -> bool {
        self.reachable
    }

    fn protocol(&self) -> &'static str {
        "scripted"
    }
}

/// Factory handing out one shared [`ScriptedPublisher`] for every
/// destination.
#[derive(Debug, Clone)]
pub struct ScriptedPublisherFactory {
    publisher: Arc<ScriptedPublisher>,
}

impl ScriptedPublisherFactory {
    /// Wraps `publisher`.
    pub fn new(publisher: Arc<ScriptedPublisher>) -> Self {
        Self { publisher }
    }

    /// The shared publisher.
    pub fn publisher(&self) -> &Arc<ScriptedPublisher> {
        &self.publisher
    }
}

impl PublisherFactory for ScriptedPublisherFactory {
    fn publisher_for(&self, _destination: &Destination) -> Result<Arc<dyn Publisher>> {
        Ok(self.publisher.clone())
    }
}
