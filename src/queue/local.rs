//! Queue service backed by a node's own SQLite store.

use super::{BoxFuture, ConsumerInfo, Handoff, QueueService, ReassignOutcome};
use crate::event::Batch;
use crate::store::LocalStore;
use std::sync::Arc;

/// Serves the queue tables of a [`LocalStore`].
///
/// Roots capture into it, branches re-emit into it, and every consumer of
/// such a node reads through it.
#[derive(Clone)]
pub struct LocalQueue {
    store: Arc<LocalStore>,
}

impl LocalQueue {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }
}

impl QueueService for LocalQueue {
    fn name(&self) -> &str {
        "local"
    }

    fn next_batch<'a>(&'a self, queue: &'a str, after_tick: i64) -> BoxFuture<'a, Option<Batch>> {
        Box::pin(self.store.next_batch(queue, after_tick))
    }

    fn ack<'a>(&'a self, queue: &'a str, consumer: &'a str, tick_id: i64) -> BoxFuture<'a, ()> {
        Box::pin(self.store.ack(queue, consumer, tick_id))
    }

    fn register_consumer<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        group: &'a str,
        start_tick: Option<i64>,
    ) -> BoxFuture<'a, ConsumerInfo> {
        Box::pin(self.store.register_consumer(queue, consumer, group, start_tick))
    }

    fn unregister_consumer<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(self.store.unregister_consumer(queue, consumer))
    }

    fn consumer_info<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, Option<ConsumerInfo>> {
        Box::pin(self.store.consumer_info(queue, consumer))
    }

    fn consumers<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Vec<ConsumerInfo>> {
        Box::pin(self.store.consumers(queue))
    }

    fn head_tick<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Option<i64>> {
        Box::pin(self.store.head_tick(queue))
    }

    fn request_pause<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.store.request_pause(queue, consumer))
    }

    fn resume<'a>(&'a self, queue: &'a str, consumer: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.store.resume(queue, consumer))
    }

    fn confirm_pause<'a>(
        &'a self,
        queue: &'a str,
        consumer: &'a str,
        handoff: &'a Handoff,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.store.confirm_pause(queue, consumer, handoff))
    }

    fn reassign_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
    ) -> BoxFuture<'a, ReassignOutcome> {
        Box::pin(self.store.reassign_consumer(queue, from, to))
    }

    fn reassign_dead_consumer<'a>(
        &'a self,
        queue: &'a str,
        from: &'a str,
        to: &'a str,
        silent_before: i64,
    ) -> BoxFuture<'a, ReassignOutcome> {
        Box::pin(self.store.reassign_dead_consumer(queue, from, to, silent_before))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationError;
    use crate::event::{row_of, Event};
    use serde_json::json;

    async fn queue() -> (Arc<LocalStore>, Arc<dyn QueueService>) {
        let store = Arc::new(LocalStore::in_memory().await.unwrap());
        let service: Arc<dyn QueueService> = Arc::new(LocalQueue::new(Arc::clone(&store)));
        (store, service)
    }

    #[tokio::test]
    async fn test_batches_through_trait_object() {
        let (store, service) = queue().await;
        store
            .enqueue("q", &[Event::insert("t", row_of([("id", json!(1))]))])
            .await
            .unwrap();
        store.tick("q").await.unwrap();

        let batch = service.next_batch("q", 0).await.unwrap().unwrap();
        assert_eq!(batch.tick_id, 1);
        assert_eq!(batch.prev_tick_id, 0);
        assert_eq!(batch.len(), 1);
        assert!(service.next_batch("q", 1).await.unwrap().is_none());
        assert_eq!(service.head_tick("q").await.unwrap(), Some(1));
        assert_eq!(service.name(), "local");
    }

    #[tokio::test]
    async fn test_handshake_through_trait_object() {
        let (_store, service) = queue().await;
        let a = service.register_consumer("q", "a", "g", Some(0)).await.unwrap();
        let b = service.register_consumer("q", "b", "g", Some(0)).await.unwrap();
        assert!(a.active);
        assert!(!b.active);

        service.ack("q", "a", 3).await.unwrap();
        assert!(matches!(
            service.ack("q", "b", 3).await,
            Err(ReplicationError::NotOwner { .. })
        ));

        service.request_pause("q", "a").await.unwrap();
        let handoff = Handoff {
            last_tick: 3,
            tables: vec![],
        };
        service.confirm_pause("q", "a", &handoff).await.unwrap();

        let outcome = service.reassign_consumer("q", "a", "b").await.unwrap();
        assert_eq!(outcome, ReassignOutcome::Reassigned { handoff });
        let b = service.consumer_info("q", "b").await.unwrap().unwrap();
        assert!(b.active);
        assert_eq!(b.last_tick, 3);

        let again = service.reassign_consumer("q", "a", "b").await.unwrap();
        assert_eq!(again, ReassignOutcome::AlreadyAssigned);

        assert_eq!(service.consumers("q").await.unwrap().len(), 2);
        assert!(service.unregister_consumer("q", "a").await.unwrap());
    }
}
