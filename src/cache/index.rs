//! Cache metadata index.
//!
//! Owns the request identity → entry mapping and the dependency links from
//! content units to the entries rendered from them.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::IndexError;
use super::keys::{CacheEntry, ContentUnitId, EntryId, RequestIdentity};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::index";

/// Typed contract over whatever engine stores cache metadata.
#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// The live entry for `identity`, if any.
    async fn find_entry(&self, identity: &RequestIdentity)
    -> Result<Option<CacheEntry>, IndexError>;

    /// Create the entry for `identity` with its dependency set.
    ///
    /// An existing entry for the same identity is replaced together with its
    /// links, and the new entry always receives a freshly minted `uid`.
    async fn create_entry(
        &self,
        identity: &RequestIdentity,
        depends_on: &HashSet<ContentUnitId>,
    ) -> Result<CacheEntry, IndexError>;

    /// Every entry linked to `unit`.
    async fn entries_depending_on(
        &self,
        unit: &ContentUnitId,
    ) -> Result<Vec<CacheEntry>, IndexError>;

    /// Remove the given entries and all of their links. Unknown ids are ignored.
    async fn delete_entries(&self, ids: &HashSet<EntryId>) -> Result<(), IndexError>;

    /// Remove every entry and link.
    async fn clear_all(&self) -> Result<(), IndexError>;

    /// Body identifiers of every live entry.
    async fn entry_uids(&self) -> Result<HashSet<Uuid>, IndexError>;

    /// Number of live entries.
    async fn entry_count(&self) -> Result<u64, IndexError>;
}

/// Index held in process memory.
///
/// Keeps the entity → entries and entry → entities maps side by side so that
/// both invalidation and entry removal are lookups rather than scans.
pub struct MemoryCacheIndex {
    state: RwLock<IndexState>,
    next_id: AtomicI64,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<EntryId, CacheEntry>,
    by_identity: HashMap<RequestIdentity, EntryId>,
    unit_to_entries: HashMap<ContentUnitId, HashSet<EntryId>>,
    entry_to_units: HashMap<EntryId, HashSet<ContentUnitId>>,
}

impl IndexState {
    fn remove_entry(&mut self, id: EntryId) -> Option<CacheEntry> {
        let entry = self.entries.remove(&id)?;
        if self.by_identity.get(&entry.identity) == Some(&id) {
            self.by_identity.remove(&entry.identity);
        }
        if let Some(units) = self.entry_to_units.remove(&id) {
            for unit in units {
                if let Some(ids) = self.unit_to_entries.get_mut(&unit) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.unit_to_entries.remove(&unit);
                    }
                }
            }
        }
        Some(entry)
    }
}

impl MemoryCacheIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Content units the entry depends on.
    pub fn units_for_entry(&self, id: EntryId) -> HashSet<ContentUnitId> {
        rw_read(&self.state, SOURCE, "units_for_entry")
            .entry_to_units
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of content units with at least one dependent entry.
    pub fn unit_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "unit_count")
            .unit_to_entries
            .len()
    }
}

impl Default for MemoryCacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheIndex for MemoryCacheIndex {
    async fn find_entry(
        &self,
        identity: &RequestIdentity,
    ) -> Result<Option<CacheEntry>, IndexError> {
        let state = rw_read(&self.state, SOURCE, "find_entry");
        Ok(state
            .by_identity
            .get(identity)
            .and_then(|id| state.entries.get(id))
            .cloned())
    }

    async fn create_entry(
        &self,
        identity: &RequestIdentity,
        depends_on: &HashSet<ContentUnitId>,
    ) -> Result<CacheEntry, IndexError> {
        let entry = CacheEntry {
            id: EntryId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            uid: Uuid::new_v4(),
            identity: identity.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        let mut state = rw_write(&self.state, SOURCE, "create_entry");
        if let Some(previous) = state.by_identity.get(identity).copied() {
            state.remove_entry(previous);
        }
        for unit in depends_on {
            state
                .unit_to_entries
                .entry(unit.clone())
                .or_default()
                .insert(entry.id);
        }
        state.entry_to_units.insert(entry.id, depends_on.clone());
        state.by_identity.insert(identity.clone(), entry.id);
        state.entries.insert(entry.id, entry.clone());

        Ok(entry)
    }

    async fn entries_depending_on(
        &self,
        unit: &ContentUnitId,
    ) -> Result<Vec<CacheEntry>, IndexError> {
        let state = rw_read(&self.state, SOURCE, "entries_depending_on");
        Ok(state
            .unit_to_entries
            .get(unit)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect())
    }

    async fn delete_entries(&self, ids: &HashSet<EntryId>) -> Result<(), IndexError> {
        let mut state = rw_write(&self.state, SOURCE, "delete_entries");
        for id in ids {
            state.remove_entry(*id);
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), IndexError> {
        *rw_write(&self.state, SOURCE, "clear_all") = IndexState::default();
        Ok(())
    }

    async fn entry_uids(&self) -> Result<HashSet<Uuid>, IndexError> {
        Ok(rw_read(&self.state, SOURCE, "entry_uids")
            .entries
            .values()
            .map(|entry| entry.uid)
            .collect())
    }

    async fn entry_count(&self) -> Result<u64, IndexError> {
        Ok(rw_read(&self.state, SOURCE, "entry_count").entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::SiteId;

    fn units(ids: &[&str]) -> HashSet<ContentUnitId> {
        ids.iter().map(|id| ContentUnitId::new(*id)).collect()
    }

    fn identity(uri: &str) -> RequestIdentity {
        RequestIdentity::new(uri, SiteId(1))
    }

    #[tokio::test]
    async fn create_and_find() {
        let index = MemoryCacheIndex::new();
        let created = index
            .create_entry(&identity("/a"), &units(&["1", "2"]))
            .await
            .expect("create");

        let found = index
            .find_entry(&identity("/a"))
            .await
            .expect("find")
            .expect("entry present");
        assert_eq!(found, created);
        assert_eq!(index.units_for_entry(created.id), units(&["1", "2"]));
        assert!(
            index
                .find_entry(&RequestIdentity::new("/a", SiteId(2)))
                .await
                .expect("find")
                .is_none()
        );
    }

    #[tokio::test]
    async fn create_replaces_existing_entry() {
        let index = MemoryCacheIndex::new();
        let first = index
            .create_entry(&identity("/a"), &units(&["1"]))
            .await
            .expect("create");
        let second = index
            .create_entry(&identity("/a"), &units(&["2"]))
            .await
            .expect("replace");

        assert_ne!(first.uid, second.uid);
        assert_ne!(first.id, second.id);
        assert_eq!(index.entry_count().await.expect("count"), 1);
        assert!(
            index
                .entries_depending_on(&ContentUnitId::new("1"))
                .await
                .expect("lookup")
                .is_empty()
        );
        assert_eq!(
            index
                .entries_depending_on(&ContentUnitId::new("2"))
                .await
                .expect("lookup"),
            vec![second]
        );
    }

    #[tokio::test]
    async fn dependency_lookup_is_many_to_many() {
        let index = MemoryCacheIndex::new();
        let a = index
            .create_entry(&identity("/a"), &units(&["1", "2"]))
            .await
            .expect("create");
        let b = index
            .create_entry(&identity("/b"), &units(&["2", "3"]))
            .await
            .expect("create");

        let shared: HashSet<Uuid> = index
            .entries_depending_on(&ContentUnitId::new("2"))
            .await
            .expect("lookup")
            .into_iter()
            .map(|entry| entry.uid)
            .collect();
        assert_eq!(shared, HashSet::from([a.uid, b.uid]));

        let only_a = index
            .entries_depending_on(&ContentUnitId::new("1"))
            .await
            .expect("lookup");
        assert_eq!(only_a, vec![a]);
    }

    #[tokio::test]
    async fn delete_entries_cleans_links() {
        let index = MemoryCacheIndex::new();
        let a = index
            .create_entry(&identity("/a"), &units(&["1", "2"]))
            .await
            .expect("create");
        let b = index
            .create_entry(&identity("/b"), &units(&["2"]))
            .await
            .expect("create");

        index
            .delete_entries(&HashSet::from([a.id, EntryId(9999)]))
            .await
            .expect("delete");

        assert!(index.find_entry(&identity("/a")).await.expect("find").is_none());
        assert_eq!(index.unit_count(), 1);
        assert_eq!(
            index
                .entries_depending_on(&ContentUnitId::new("2"))
                .await
                .expect("lookup"),
            vec![b.clone()]
        );
        assert_eq!(index.entry_uids().await.expect("uids"), HashSet::from([b.uid]));
    }

    #[tokio::test]
    async fn clear_all_removes_everything() {
        let index = MemoryCacheIndex::new();
        index
            .create_entry(&identity("/a"), &units(&["1"]))
            .await
            .expect("create");
        index
            .create_entry(&identity("/b"), &HashSet::new())
            .await
            .expect("create");

        index.clear_all().await.expect("clear");
        assert_eq!(index.entry_count().await.expect("count"), 0);
        assert_eq!(index.unit_count(), 0);
    }
}
