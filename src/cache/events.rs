//! Cache event system.
//!
//! Content-change signals and flush requests from the host are queued here
//! and applied by the [`CacheConsumer`](super::CacheConsumer).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::keys::ContentUnitId;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";
const DEFAULT_QUEUE_LIMIT: usize = 10_000;
pub(crate) const METRIC_QUEUE_LEN: &str = "pagecache_event_queue_len";
pub(crate) const METRIC_QUEUE_COLLAPSED: &str = "pagecache_event_queue_collapsed_total";

/// Monotonic sequence number of an event within this process.
pub type Epoch = u64;

/// Cache event with idempotency and ordering support.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A content unit was created, updated, or deleted.
    ContentUnitChanged { unit: ContentUnitId },
    /// An operator asked for a full flush.
    FlushRequested,
}

/// In-memory FIFO of pending cache events.
///
/// Bounded: when full, the pending events are replaced by a single
/// `FlushRequested` so no invalidation is ever lost.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::new_with_limit(DEFAULT_QUEUE_LIMIT)
    }

    pub fn new_with_limit(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, kind: EventKind) {
        let event = CacheEvent::new(kind, self.next_epoch());

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit {
            warn!(
                pending = queue.len(),
                limit = self.limit,
                "Cache event queue full, collapsing into a full flush"
            );
            counter!(METRIC_QUEUE_COLLAPSED).increment(1);
            queue.clear();
            queue.push_back(CacheEvent::new(EventKind::FlushRequested, event.epoch));
        } else {
            queue.push_back(event);
        }
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Publish a content-unit change.
    pub fn content_unit_changed(&self, unit: impl Into<ContentUnitId>) {
        self.publish(EventKind::ContentUnitChanged { unit: unit.into() });
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
