//! Body storage.
//!
//! Cached response bodies live apart from their metadata, addressed only by
//! the entry `uid`. The filesystem store is the production medium; the
//! in-memory store backs tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::StoreError;
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";
const BODY_EXTENSION: &str = "html";
const TEMP_EXTENSION: &str = "tmp";

/// Storage for cached response bodies.
///
/// Every operation is atomic on its own: a concurrent reader sees either the
/// previous body or the new one, never a torn write.
#[async_trait]
pub trait BodyStore: Send + Sync {
    /// Persist `body` under `uid`, replacing any previous body.
    async fn put(&self, uid: Uuid, body: Bytes) -> Result<(), StoreError>;

    /// Fetch the body stored under `uid`; `None` when absent.
    async fn get(&self, uid: Uuid) -> Result<Option<Bytes>, StoreError>;

    /// Remove the body stored under `uid`. Absent bodies are not an error.
    async fn delete(&self, uid: Uuid) -> Result<(), StoreError>;

    /// Remove every stored body.
    async fn clear_all(&self) -> Result<(), StoreError>;

    /// Whole seconds elapsed since the body under `uid` was written.
    async fn age_seconds(&self, uid: Uuid) -> Result<Option<u64>, StoreError>;

    /// Identifiers of every stored body.
    async fn list_uids(&self) -> Result<HashSet<Uuid>, StoreError>;
}

// ============================================================================
// Filesystem store
// ============================================================================

/// One file per body, `<directory>/<uid>.html`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a partially written body. Age is the file mtime.
#[derive(Debug, Clone)]
pub struct FsBodyStore {
    directory: PathBuf,
}

impl FsBodyStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn body_path(&self, uid: Uuid) -> PathBuf {
        self.directory.join(format!("{uid}.{BODY_EXTENSION}"))
    }

    fn temp_path(&self, uid: Uuid) -> PathBuf {
        self.directory
            .join(format!(".{uid}.{}.{TEMP_EXTENSION}", Uuid::new_v4().simple()))
    }

    async fn read_dir_entries(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Directory(err)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::Directory)? {
            paths.push(entry.path());
        }
        Ok(paths)
    }
}

fn body_uid(path: &Path) -> Option<Uuid> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(BODY_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| Uuid::parse_str(stem).ok())
}

fn is_temp_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(TEMP_EXTENSION)
}

#[async_trait]
impl BodyStore for FsBodyStore {
    async fn put(&self, uid: Uuid, body: Bytes) -> Result<(), StoreError> {
        let write_error = |source| StoreError::Write { uid, source };

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(write_error)?;

        let temp = self.temp_path(uid);
        if let Err(source) = tokio::fs::write(&temp, &body).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_error(source));
        }
        if let Err(source) = tokio::fs::rename(&temp, self.body_path(uid)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_error(source));
        }
        Ok(())
    }

    async fn get(&self, uid: Uuid) -> Result<Option<Bytes>, StoreError> {
        match tokio::fs::read(self.body_path(uid)).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read { uid, source }),
        }
    }

    async fn delete(&self, uid: Uuid) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.body_path(uid)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Delete { uid, source }),
        }
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        for path in self.read_dir_entries().await? {
            if body_uid(&path).is_none() && !is_temp_file(&path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::Directory(err)),
            }
        }
        Ok(())
    }

    async fn age_seconds(&self, uid: Uuid) -> Result<Option<u64>, StoreError> {
        let metadata = match tokio::fs::metadata(self.body_path(uid)).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { uid, source }),
        };
        let written_at = metadata
            .modified()
            .map_err(|source| StoreError::Read { uid, source })?;
        let age = SystemTime::now()
            .duration_since(written_at)
            .unwrap_or_default();
        Ok(Some(age.as_secs()))
    }

    async fn list_uids(&self) -> Result<HashSet<Uuid>, StoreError> {
        Ok(self
            .read_dir_entries()
            .await?
            .iter()
            .filter_map(|path| body_uid(path))
            .collect())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Source of "now" for the in-memory store.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = mutex_lock(&self.now, SOURCE, "manual_clock.advance");
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, SOURCE, "manual_clock.now")
    }
}

#[derive(Clone)]
struct StoredBody {
    body: Bytes,
    written_at: OffsetDateTime,
}

/// Bodies held in process memory.
pub struct MemoryBodyStore {
    bodies: RwLock<HashMap<Uuid, StoredBody>>,
    clock: std::sync::Arc<dyn Clock>,
}

impl MemoryBodyStore {
    pub fn new() -> Self {
        Self::with_clock(std::sync::Arc::new(SystemClock))
    }

    pub fn with_clock(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            bodies: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored bodies.
    pub fn len(&self) -> usize {
        rw_read(&self.bodies, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBodyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BodyStore for MemoryBodyStore {
    async fn put(&self, uid: Uuid, body: Bytes) -> Result<(), StoreError> {
        let stored = StoredBody {
            body,
            written_at: self.clock.now(),
        };
        rw_write(&self.bodies, SOURCE, "put").insert(uid, stored);
        Ok(())
    }

    async fn get(&self, uid: Uuid) -> Result<Option<Bytes>, StoreError> {
        Ok(rw_read(&self.bodies, SOURCE, "get")
            .get(&uid)
            .map(|stored| stored.body.clone()))
    }

    async fn delete(&self, uid: Uuid) -> Result<(), StoreError> {
        rw_write(&self.bodies, SOURCE, "delete").remove(&uid);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        rw_write(&self.bodies, SOURCE, "clear_all").clear();
        Ok(())
    }

    async fn age_seconds(&self, uid: Uuid) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now();
        Ok(rw_read(&self.bodies, SOURCE, "age_seconds")
            .get(&uid)
            .map(|stored| {
                let age = (now - stored.written_at).whole_seconds();
                u64::try_from(age).unwrap_or(0)
            }))
    }

    async fn list_uids(&self) -> Result<HashSet<Uuid>, StoreError> {
        Ok(rw_read(&self.bodies, SOURCE, "list_uids")
            .keys()
            .copied()
            .collect())
    }
}
