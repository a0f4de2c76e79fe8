//! Dependency recording for capturing requests.
//!
//! On a cache miss the interceptor hands a [`DependencyRecorder`] to the
//! renderer. Every content unit the renderer reads is recorded on it, and the
//! collected set becomes the entry's dependency links once the response is
//! stored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::keys::ContentUnitId;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::deps";

/// Shared sink for the content units used while rendering one response.
///
/// Cheap to clone; clones feed the same set.
#[derive(Debug, Clone, Default)]
pub struct DependencyRecorder {
    units: Arc<Mutex<HashSet<ContentUnitId>>>,
}

impl DependencyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dependency.
    ///
    /// Call this before reading data that affects the response.
    ///
    /// ```ignore
    /// recorder.record(ContentUnitId::from(post.id));
    /// let body = render_post(&post);
    /// ```
    pub fn record(&self, unit: impl Into<ContentUnitId>) {
        mutex_lock(&self.units, SOURCE, "record").insert(unit.into());
    }

    pub fn record_all<I, U>(&self, units: I)
    where
        I: IntoIterator<Item = U>,
        U: Into<ContentUnitId>,
    {
        let mut guard = mutex_lock(&self.units, SOURCE, "record_all");
        guard.extend(units.into_iter().map(Into::into));
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> HashSet<ContentUnitId> {
        mutex_lock(&self.units, SOURCE, "snapshot").clone()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.units, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_deduplicates() {
        let recorder = DependencyRecorder::new();
        recorder.record("42");
        recorder.record("42");
        recorder.record(42u64);
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn clones_share_the_same_set() {
        let recorder = DependencyRecorder::new();
        let handle = recorder.clone();
        handle.record_all(["1", "2", "3"]);
        assert_eq!(
            recorder.snapshot(),
            ["1", "2", "3"].into_iter().map(ContentUnitId::from).collect()
        );
    }

    #[tokio::test]
    async fn record_across_tasks() {
        let recorder = DependencyRecorder::new();
        let handles: Vec<_> = (0..4u64)
            .map(|id| {
                let recorder = recorder.clone();
                tokio::spawn(async move { recorder.record(id) })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task completes");
        }
        assert_eq!(recorder.len(), 4);
    }
}
