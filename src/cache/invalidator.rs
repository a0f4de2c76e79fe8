//! Selective and full invalidation.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::error::CacheError;
use super::events::Epoch;
use super::index::CacheIndex;
use super::keys::{ContentUnitId, EntryId};
use super::lock::mutex_lock;
use super::store::BodyStore;

pub(crate) const METRIC_INVALIDATED: &str = "pagecache_invalidated_total";

const SOURCE: &str = "cache::invalidator";
const TRACKED_UNITS_LIMIT: usize = 4_096;

/// When each content unit was last invalidated, in process-local epochs.
///
/// A capture notes [`current`](Self::current) before the renderer runs. If a
/// unit it recorded was invalidated at a later epoch, or the whole cache was
/// flushed later, the captured body is already stale and must not be stored.
#[derive(Debug, Default)]
pub struct InvalidationEpochs {
    current: AtomicU64,
    state: Mutex<EpochState>,
}

#[derive(Debug, Default)]
struct EpochState {
    /// Captures started before this epoch are stale whatever they depend on.
    floor: Epoch,
    units: HashMap<ContentUnitId, Epoch>,
}

impl InvalidationEpochs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        self.current.load(Ordering::SeqCst)
    }

    /// Must run before the index is asked for the unit's dependents.
    pub fn unit_invalidated(&self, unit: &ContentUnitId) {
        let mut state = mutex_lock(&self.state, SOURCE, "unit_invalidated");
        let epoch = self.advance();
        if state.units.len() >= TRACKED_UNITS_LIMIT && !state.units.contains_key(unit) {
            // Forgetting per-unit history makes every capture in flight stale.
            state.units.clear();
            state.floor = epoch;
        }
        state.units.insert(unit.clone(), epoch);
    }

    /// Must run before the store and index are cleared.
    pub fn flushed(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "flushed");
        let epoch = self.advance();
        state.units.clear();
        state.floor = epoch;
    }

    /// Whether a capture started at `started_at` with these units is stale.
    pub fn is_stale<'a, I>(&self, started_at: Epoch, units: I) -> bool
    where
        I: IntoIterator<Item = &'a ContentUnitId>,
    {
        let state = mutex_lock(&self.state, SOURCE, "is_stale");
        if state.floor > started_at {
            return true;
        }
        units
            .into_iter()
            .any(|unit| state.units.get(unit).is_some_and(|epoch| *epoch > started_at))
    }

    fn advance(&self) -> Epoch {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Result of invalidating one content unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub entries_removed: usize,
    /// Bodies whose deletion failed; the entries are gone regardless.
    pub body_delete_failures: usize,
}

/// Result of a sweep over the body store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_removed: usize,
    pub orphans_removed: usize,
}

/// Removes cache entries and their bodies.
#[derive(Clone)]
pub struct Invalidator {
    store: Arc<dyn BodyStore>,
    index: Arc<dyn CacheIndex>,
    epochs: Arc<InvalidationEpochs>,
}

impl Invalidator {
    pub fn new(store: Arc<dyn BodyStore>, index: Arc<dyn CacheIndex>) -> Self {
        Self::with_epochs(store, index, Arc::new(InvalidationEpochs::new()))
    }

    /// Invalidator that reports to the epochs a [`PageCache`](super::PageCache)
    /// checks its captures against.
    pub fn with_epochs(
        store: Arc<dyn BodyStore>,
        index: Arc<dyn CacheIndex>,
        epochs: Arc<InvalidationEpochs>,
    ) -> Self {
        Self {
            store,
            index,
            epochs,
        }
    }

    /// Drop every entry rendered from `unit`.
    ///
    /// Body deletion is best-effort per entry; metadata for all dependents is
    /// removed in one index call afterwards.
    #[instrument(skip(self), fields(unit = %unit))]
    pub async fn on_content_unit_changed(
        &self,
        unit: &ContentUnitId,
    ) -> Result<InvalidationReport, CacheError> {
        self.epochs.unit_invalidated(unit);
        let entries = self.index.entries_depending_on(unit).await?;
        if entries.is_empty() {
            return Ok(InvalidationReport::default());
        }

        let mut report = InvalidationReport::default();
        let mut ids: HashSet<EntryId> = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if let Err(err) = self.store.delete(entry.uid).await {
                warn!(uid = %entry.uid, error = %err, "failed to delete page body during invalidation");
                report.body_delete_failures += 1;
            }
            ids.insert(entry.id);
        }

        self.index.delete_entries(&ids).await?;
        report.entries_removed = ids.len();

        info!(
            entries_removed = report.entries_removed,
            body_delete_failures = report.body_delete_failures,
            "Page cache invalidated for content unit"
        );
        counter!(METRIC_INVALIDATED, "scope" => "unit").increment(report.entries_removed as u64);

        Ok(report)
    }

    /// Drop every body, then every entry.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        self.epochs.flushed();
        self.store.clear_all().await?;
        self.index.clear_all().await?;
        info!("Page cache flushed");
        counter!(METRIC_INVALIDATED, "scope" => "all").increment(1);
        Ok(())
    }

    /// Delete bodies that are expired or no longer referenced by any entry.
    ///
    /// Entry metadata is left alone, matching what the read path does with
    /// expired entries.
    #[instrument(skip(self))]
    pub async fn sweep(&self, duration: NonZeroU64) -> Result<SweepReport, CacheError> {
        let live = self.index.entry_uids().await?;
        let stored = self.store.list_uids().await?;
        let mut report = SweepReport::default();

        for uid in stored {
            if !live.contains(&uid) {
                self.store.delete(uid).await?;
                report.orphans_removed += 1;
                continue;
            }
            if let Some(age) = self.store.age_seconds(uid).await?
                && age >= duration.get()
            {
                self.store.delete(uid).await?;
                report.expired_removed += 1;
            }
        }

        if report != SweepReport::default() {
            info!(
                expired_removed = report.expired_removed,
                orphans_removed = report.orphans_removed,
                "Page cache sweep complete"
            );
        }
        Ok(report)
    }
}
