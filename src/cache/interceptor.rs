//! Request interceptor.
//!
//! Read path: gate → identity → index lookup → freshness → serve or capture.
//! Write path: gate (with status) → register dependencies → re-resolve entry →
//! persist body → re-check invalidation epochs. Nothing in here fails the request: every cache error is
//! logged and the caller always gets a usable response.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::deps::DependencyRecorder;
use super::error::CacheError;
use super::events::Epoch;
use super::gate::{self, RequestContext};
use super::index::CacheIndex;
use super::invalidator::{InvalidationEpochs, Invalidator};
use super::keys::{CacheEntry, ContentUnitId, RequestIdentity};
use super::store::BodyStore;

pub(crate) const METRIC_HIT: &str = "pagecache_hit_total";
pub(crate) const METRIC_MISS: &str = "pagecache_miss_total";
pub(crate) const METRIC_BYPASS: &str = "pagecache_bypass_total";
pub(crate) const METRIC_WRITE: &str = "pagecache_write_total";
pub(crate) const METRIC_WRITE_ERROR: &str = "pagecache_write_error_total";

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_MARKUP: &str = "text/html;charset=UTF-8";

/// How a stored body is presented to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Markup,
}

impl BodyKind {
    pub fn content_type(self) -> &'static str {
        match self {
            BodyKind::Json => CONTENT_TYPE_JSON,
            BodyKind::Markup => CONTENT_TYPE_MARKUP,
        }
    }
}

/// Sniff the body kind from its first byte.
///
/// A body starting with `[` or `{` that parses as JSON is JSON; anything else,
/// including a malformed JSON-looking body, is markup.
pub fn classify_body(body: &[u8]) -> BodyKind {
    if !matches!(body.first(), Some(b'[' | b'{')) {
        return BodyKind::Markup;
    }
    match serde_json::from_slice::<serde::de::IgnoredAny>(body) {
        Ok(_) => BodyKind::Json,
        Err(err) => {
            debug!(error = %err, "cached body looks like JSON but does not parse, serving as markup");
            BodyKind::Markup
        }
    }
}

/// A stored response ready to be written verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub body: Bytes,
    pub kind: BodyKind,
}

impl CachedPage {
    pub fn new(body: Bytes) -> Self {
        let kind = classify_body(&body);
        Self { body, kind }
    }

    pub fn content_type(&self) -> &'static str {
        self.kind.content_type()
    }
}

/// Capture state for a request that missed the cache.
///
/// Dropping it discards the capture; only [`PageCache::complete`] writes.
#[derive(Debug)]
pub struct Capture {
    identity: RequestIdentity,
    recorder: DependencyRecorder,
    started_at: Epoch,
}

impl Capture {
    fn new(identity: RequestIdentity, started_at: Epoch) -> Self {
        Self {
            identity,
            recorder: DependencyRecorder::new(),
            started_at,
        }
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    /// Invalidation epoch observed before the renderer ran.
    pub fn started_at(&self) -> Epoch {
        self.started_at
    }

    /// Sink the renderer records its content units on.
    pub fn recorder(&self) -> &DependencyRecorder {
        &self.recorder
    }
}

/// Outcome of the read path.
#[derive(Debug)]
pub enum Lookup {
    /// Not eligible: run the host application untouched.
    Bypass,
    /// Fresh entry: write it out and skip the host application.
    Hit(CachedPage),
    /// No usable entry: run the host application and hand the result to
    /// [`PageCache::complete`].
    Miss(Capture),
}

/// Response produced by the host application's renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub status: StatusCode,
    pub body: Bytes,
}

impl RenderedPage {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.into(),
        }
    }
}

/// What [`PageCache::serve`] sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResponse {
    Cached(CachedPage),
    Rendered(RenderedPage),
}

impl PageResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            PageResponse::Cached(_) => StatusCode::OK,
            PageResponse::Rendered(page) => page.status,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            PageResponse::Cached(page) => &page.body,
            PageResponse::Rendered(page) => &page.body,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, PageResponse::Cached(_))
    }
}

/// The full-page cache: gate, index, and body store wired together.
pub struct PageCache {
    config: CacheConfig,
    store: Arc<dyn BodyStore>,
    index: Arc<dyn CacheIndex>,
    epochs: Arc<InvalidationEpochs>,
}

impl PageCache {
    pub fn new(config: CacheConfig, store: Arc<dyn BodyStore>, index: Arc<dyn CacheIndex>) -> Self {
        Self {
            config,
            store,
            index,
            epochs: Arc::new(InvalidationEpochs::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BodyStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn CacheIndex> {
        &self.index
    }

    /// Invalidator sharing this cache's store, index and epochs.
    ///
    /// Invalidations must go through it for in-flight captures to notice them.
    pub fn invalidator(&self) -> Invalidator {
        Invalidator::with_epochs(
            Arc::clone(&self.store),
            Arc::clone(&self.index),
            Arc::clone(&self.epochs),
        )
    }

    /// Read path.
    #[instrument(skip_all, fields(uri = %request.identity.uri, site = %request.identity.site_id))]
    pub async fn lookup(&self, request: &RequestContext) -> Lookup {
        if let Some(rule) = gate::rejection(request, &self.config, None) {
            debug!(cache = "page", outcome = "bypass", reason = rule.as_str());
            counter!(METRIC_BYPASS, "reason" => rule.as_str()).increment(1);
            return Lookup::Bypass;
        }

        let started_at = self.epochs.current();
        let identity = request.identity.clone();
        let entry = match self.index.find_entry(&identity).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return miss(identity, started_at, "no_entry"),
            Err(err) => {
                warn!(error = %err, "page cache index lookup failed");
                return miss(identity, started_at, "index_error");
            }
        };

        let duration = self.config.effective_duration().await;
        match self.store.age_seconds(entry.uid).await {
            Ok(Some(age)) if age >= duration.get() => {
                if let Err(err) = self.store.delete(entry.uid).await {
                    warn!(uid = %entry.uid, error = %err, "failed to delete expired page body");
                }
                debug!(uid = %entry.uid, age, duration = duration.get(), "page cache entry expired");
                return miss(identity, started_at, "expired");
            }
            Ok(Some(_)) => {}
            Ok(None) => return miss(identity, started_at, "body_missing"),
            Err(err) => {
                warn!(uid = %entry.uid, error = %err, "failed to stat page body");
                return miss(identity, started_at, "store_error");
            }
        }

        match self.store.get(entry.uid).await {
            Ok(Some(body)) => {
                let page = CachedPage::new(body);
                debug!(
                    cache = "page",
                    outcome = "hit",
                    uid = %entry.uid,
                    content_type = page.content_type(),
                    "serving cached page"
                );
                counter!(METRIC_HIT).increment(1);
                Lookup::Hit(page)
            }
            Ok(None) => miss(identity, started_at, "body_missing"),
            Err(err) => {
                warn!(uid = %entry.uid, error = %err, "failed to read page body");
                miss(identity, started_at, "store_error")
            }
        }
    }

    /// Write path. Returns the bytes to send to the client, which are always
    /// the captured bytes, whether or not the cache write succeeded.
    #[instrument(skip_all, fields(uri = %capture.identity.uri, site = %capture.identity.site_id, status = status.as_u16()))]
    pub async fn complete(
        &self,
        capture: Capture,
        request: &RequestContext,
        status: StatusCode,
        body: Bytes,
    ) -> Bytes {
        if let Some(rule) = gate::rejection(request, &self.config, Some(status)) {
            debug!(cache = "page", reason = rule.as_str(), "response not stored");
            return body;
        }

        match self.persist(&capture, body.clone()).await {
            Ok(entry) => {
                debug!(
                    cache = "page",
                    uid = %entry.uid,
                    bytes = body.len(),
                    deps_count = capture.recorder.len(),
                    "stored page"
                );
                counter!(METRIC_WRITE).increment(1);
            }
            Err(CacheError::InconsistentState { identity }) => {
                info!(
                    identity = %identity,
                    "no page cache entry after capture, skipping write"
                );
            }
            Err(CacheError::Invalidated { identity }) => {
                debug!(
                    identity = %identity,
                    "content changed while rendering, response served uncached"
                );
            }
            Err(err) => {
                warn!(error = %err, "page cache write failed, response served uncached");
                counter!(METRIC_WRITE_ERROR).increment(1);
            }
        }

        body
    }

    /// Run both paths around a renderer.
    ///
    /// The renderer receives the recorder for its content units. On a hit it
    /// is never called.
    pub async fn serve<F, Fut>(&self, request: &RequestContext, render: F) -> PageResponse
    where
        F: FnOnce(DependencyRecorder) -> Fut,
        Fut: Future<Output = RenderedPage>,
    {
        match self.lookup(request).await {
            Lookup::Hit(page) => PageResponse::Cached(page),
            Lookup::Bypass => PageResponse::Rendered(render(DependencyRecorder::new()).await),
            Lookup::Miss(capture) => {
                let rendered = render(capture.recorder().clone()).await;
                let status = rendered.status;
                let body = self.complete(capture, request, status, rendered.body).await;
                PageResponse::Rendered(RenderedPage { status, body })
            }
        }
    }

    /// Create (or replace) the entry for `identity`.
    ///
    /// The previous entry's body is removed before the index swaps in a new
    /// entry with a fresh `uid`.
    pub async fn register(
        &self,
        identity: &RequestIdentity,
        depends_on: &HashSet<ContentUnitId>,
    ) -> Result<CacheEntry, CacheError> {
        if let Some(previous) = self.index.find_entry(identity).await? {
            self.store.delete(previous.uid).await?;
        }
        Ok(self.index.create_entry(identity, depends_on).await?)
    }

    /// Store the captured body.
    ///
    /// Epochs are checked before registering and again once the body is in
    /// place: an invalidation that queried dependents while `register` ran
    /// cannot have seen this entry.
    async fn persist(&self, capture: &Capture, body: Bytes) -> Result<CacheEntry, CacheError> {
        let depends_on = capture.recorder.snapshot();
        let invalidated = || CacheError::Invalidated {
            identity: capture.identity.clone(),
        };
        if self.epochs.is_stale(capture.started_at, &depends_on) {
            return Err(invalidated());
        }

        let created = if depends_on.is_empty() {
            None
        } else {
            Some(self.register(&capture.identity, &depends_on).await?)
        };

        let entry = self.index.find_entry(&capture.identity).await?.ok_or_else(|| {
            CacheError::InconsistentState {
                identity: capture.identity.clone(),
            }
        })?;
        // Entries registered elsewhere outlive a failed write; a missing body
        // already reads as a miss.
        let owned = created.is_some_and(|created| created.uid == entry.uid);

        if let Err(err) = self.store.put(entry.uid, body).await {
            if owned {
                self.drop_entry(&entry).await;
            }
            return Err(err.into());
        }

        if self.epochs.is_stale(capture.started_at, &depends_on) {
            if let Err(err) = self.store.delete(entry.uid).await {
                warn!(uid = %entry.uid, error = %err, "failed to delete page body invalidated during write");
            }
            if owned {
                self.drop_entry(&entry).await;
            }
            return Err(invalidated());
        }
        Ok(entry)
    }

    async fn drop_entry(&self, entry: &CacheEntry) {
        if let Err(err) = self.index.delete_entries(&HashSet::from([entry.id])).await {
            warn!(uid = %entry.uid, error = %err, "failed to drop page cache entry after aborted write");
        }
    }
}

fn miss(identity: RequestIdentity, started_at: Epoch, reason: &'static str) -> Lookup {
    debug!(cache = "page", outcome = "miss", reason, "capturing response");
    counter!(METRIC_MISS, "reason" => reason).increment(1);
    Lookup::Miss(Capture::new(identity, started_at))
}
