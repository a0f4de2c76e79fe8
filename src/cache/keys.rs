//! Cache key definitions.
//!
//! `RequestIdentity` addresses a cached page, `ContentUnitId` names the data a
//! page was rendered from, and `CacheEntry` binds the two to a body `uid`.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Logical site (tenant) a request is served for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub i32);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a cacheable resource: the normalized uri plus the site it is served for.
///
/// Both the read and the write path build identities through [`RequestIdentity::from_parts`]
/// so that the same request always maps to the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub uri: String,
    pub site_id: SiteId,
}

impl RequestIdentity {
    pub fn new(uri: impl Into<String>, site_id: SiteId) -> Self {
        Self {
            uri: uri.into(),
            site_id,
        }
    }

    /// Build an identity from a request path and optional query string.
    ///
    /// An empty query is dropped, so `/a` and `/a?` share an entry.
    pub fn from_parts(path: &str, query: Option<&str>, site_id: SiteId) -> Self {
        let uri = match query.filter(|q| !q.is_empty()) {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };
        Self { uri, site_id }
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site:{}:{}", self.site_id, self.uri)
    }
}

/// Identifies a piece of underlying content (a record, an asset, a global).
///
/// When it changes, every page rendered from it must be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentUnitId(String);

impl ContentUnitId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentUnitId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContentUnitId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for ContentUnitId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

/// Index-local entry identifier, referenced by dependency links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata record binding a request identity to a stored body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: EntryId,
    /// Body identifier. Minted once per creation and never reused.
    pub uid: Uuid,
    pub identity: RequestIdentity,
    pub created_at: OffsetDateTime,
}
