//! Cache trigger service.
//!
//! Provides a high-level API for publishing cache events and optionally
//! consuming them immediately.

use std::sync::Arc;

use super::consumer::CacheConsumer;
use super::events::{EventKind, EventQueue};
use super::keys::ContentUnitId;

/// Cache trigger for publishing cache events.
///
/// Events are published even while the cache is disabled: entries written
/// before it was switched off must not come back stale when it is switched
/// on again.
///
/// # Usage
///
/// ```ignore
/// // After a successful entry save:
/// trigger.content_unit_changed(entry.id, false).await;
/// ```
pub struct CacheTrigger {
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer>,
}

impl CacheTrigger {
    pub fn new(queue: Arc<EventQueue>, consumer: Arc<CacheConsumer>) -> Self {
        Self { queue, consumer }
    }

    /// Publish an event and optionally consume immediately.
    ///
    /// Without `consume_now` the event waits for the background consumer or
    /// the next explicit consumption.
    pub async fn trigger(&self, kind: EventKind, consume_now: bool) {
        self.queue.publish(kind);

        if consume_now {
            self.consumer.consume_all().await;
        }
    }

    pub async fn content_unit_changed(&self, unit: impl Into<ContentUnitId>, consume_now: bool) {
        self.trigger(
            EventKind::ContentUnitChanged { unit: unit.into() },
            consume_now,
        )
        .await;
    }

    pub async fn flush(&self, consume_now: bool) {
        self.trigger(EventKind::FlushRequested, consume_now).await;
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn consumer(&self) -> &Arc<CacheConsumer> {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use bytes::Bytes;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::index::{CacheIndex, MemoryCacheIndex};
    use crate::cache::invalidator::Invalidator;
    use crate::cache::keys::{RequestIdentity, SiteId};
    use crate::cache::store::{BodyStore, MemoryBodyStore};

    fn create_trigger(
        config: CacheConfig,
    ) -> (CacheTrigger, Arc<MemoryBodyStore>, Arc<MemoryCacheIndex>) {
        let store = Arc::new(MemoryBodyStore::new());
        let index = Arc::new(MemoryCacheIndex::new());
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(CacheConsumer::new(
            config,
            queue.clone(),
            Invalidator::new(store.clone(), index.clone()),
        ));
        (CacheTrigger::new(queue, consumer), store, index)
    }

    #[tokio::test]
    async fn trigger_publishes_event() {
        let (trigger, _, _) = create_trigger(CacheConfig::default());
        assert!(trigger.queue().is_empty());

        trigger.content_unit_changed("1", false).await;
        assert_eq!(trigger.queue().len(), 1);
    }

    #[tokio::test]
    async fn trigger_consumes_immediately_when_requested() {
        let (trigger, store, index) = create_trigger(CacheConfig::default());
        let entry = index
            .create_entry(
                &RequestIdentity::new("/a", SiteId(1)),
                &HashSet::from([ContentUnitId::new("1")]),
            )
            .await
            .expect("create");
        store
            .put(entry.uid, Bytes::from_static(b"a"))
            .await
            .expect("put");

        trigger.content_unit_changed("1", true).await;

        assert!(trigger.queue().is_empty());
        assert_eq!(index.entry_count().await.expect("count"), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn trigger_still_publishes_when_cache_disabled() {
        let (trigger, _, _) = create_trigger(CacheConfig {
            enabled: false,
            ..Default::default()
        });

        trigger.flush(false).await;
        assert_eq!(trigger.queue().len(), 1);
    }
}
