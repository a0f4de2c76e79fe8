//! Cache consumer.
//!
//! Drains the event queue in batches, merges the batch into a plan, and
//! applies it through the [`Invalidator`]. Work that fails is published again
//! so the next consumption retries it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::{CacheEvent, EventKind, EventQueue};
use super::invalidator::Invalidator;
use super::keys::ContentUnitId;

pub(crate) const METRIC_CONSUME_MS: &str = "pagecache_consume_ms";

/// Work derived from one batch of events.
///
/// A flush anywhere in the batch supersedes every unit invalidation in it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConsumptionPlan {
    pub flush: bool,
    pub invalidate_units: BTreeSet<ContentUnitId>,
}

impl ConsumptionPlan {
    pub fn from_events(events: &[CacheEvent]) -> Self {
        let mut plan = Self::default();
        for event in events {
            match &event.kind {
                EventKind::FlushRequested => plan.flush = true,
                EventKind::ContentUnitChanged { unit } => {
                    plan.invalidate_units.insert(unit.clone());
                }
            }
        }
        if plan.flush {
            plan.invalidate_units.clear();
        }
        plan
    }
}

impl fmt::Display for ConsumptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConsumptionPlan {{ flush: {}, invalidate: {} }}",
            self.flush,
            self.invalidate_units.len()
        )
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    entries_removed: usize,
    requeued: usize,
}

/// Applies queued cache events.
pub struct CacheConsumer {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    invalidator: Invalidator,
}

impl CacheConsumer {
    pub fn new(config: CacheConfig, queue: Arc<EventQueue>, invalidator: Invalidator) -> Self {
        Self {
            config,
            queue,
            invalidator,
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Returns true if any events were processed. A failed unit does not stop
    /// the rest of the batch.
    pub async fn consume(&self) -> bool {
        self.consume_batch().await.is_some()
    }

    /// Consume until the queue is empty or a batch had to requeue work.
    ///
    /// Requeued work waits for the next call instead of being retried in a
    /// tight loop.
    pub async fn consume_all(&self) -> usize {
        let mut batches = 0;
        while let Some(outcome) = self.consume_batch().await {
            batches += 1;
            if outcome.requeued > 0 {
                break;
            }
        }
        batches
    }

    #[instrument(skip(self))]
    async fn consume_batch(&self) -> Option<BatchOutcome> {
        let started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit);
        let (first, last) = (events.first()?, events.last()?);

        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = ConsumptionPlan::from_events(&events);
        info!(
            event_count = events.len(),
            event_ids = ?event_ids,
            first_epoch = first.epoch,
            last_epoch = last.epoch,
            plan = %plan,
            "Cache consumption starting"
        );

        let mut outcome = BatchOutcome::default();
        if plan.flush {
            if let Err(err) = self.invalidator.clear_all().await {
                warn!(error = %err, "Cache flush failed, requeueing");
                self.queue.publish(EventKind::FlushRequested);
                outcome.requeued += 1;
            }
        } else {
            for unit in &plan.invalidate_units {
                match self.invalidator.on_content_unit_changed(unit).await {
                    Ok(report) => outcome.entries_removed += report.entries_removed,
                    Err(err) => {
                        warn!(unit = %unit, error = %err, "Cache invalidation failed, requeueing");
                        self.queue.content_unit_changed(unit.clone());
                        outcome.requeued += 1;
                    }
                }
            }
        }

        info!(
            event_count = events.len(),
            entries_removed = outcome.entries_removed,
            requeued = outcome.requeued,
            "Cache consumption complete"
        );
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        Some(outcome)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}
