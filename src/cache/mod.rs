//! Full-page response cache.
//!
//! Stores the complete body of eligible `GET` responses and replays it on
//! later identical requests without running the host application:
//!
//! - **Gate**: decides whether a request may read or write the cache
//! - **Body store**: response bodies keyed by entry uid
//! - **Index**: request identity → entry, plus entry ↔ content unit links
//! - **Interceptor**: read path (serve or capture) and write path (store)
//! - **Invalidator**: drops entries when a content unit changes, or all of them,
//!   and bumps the epochs in-flight captures are checked against
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `pagecache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! force_on = false
//! duration_secs = 3600
//! directory = "storage/runtime/pagecache"
//! # ... see config/default.toml for all options
//! ```
//!
//! A `settings.json` file in the body directory (`{"cacheDuration": 600}`)
//! overrides the duration and is re-read on every lookup.

mod config;
mod consumer;
pub mod deps;
mod error;
mod events;
mod gate;
mod index;
mod interceptor;
mod invalidator;
mod keys;
mod lock;
mod middleware;
mod store;
mod trigger;

pub use config::{CacheConfig, DEFAULT_CACHE_DURATION_SECS, SIDECAR_FILE_NAME, SidecarSettings};
pub use consumer::{CacheConsumer, ConsumptionPlan};
pub use deps::DependencyRecorder;
pub use error::{CacheError, IndexError, StoreError};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use gate::{HostStatus, Rejection, RequestContext, is_cacheable, rejection};
pub use index::{CacheIndex, MemoryCacheIndex};
pub use interceptor::{
    BodyKind, CachedPage, Capture, Lookup, PageCache, PageResponse, RenderedPage, classify_body,
};
pub use invalidator::{InvalidationEpochs, InvalidationReport, Invalidator, SweepReport};
pub use keys::{CacheEntry, ContentUnitId, EntryId, RequestIdentity, SiteId};
pub use middleware::{CacheState, HostState, RequestClassifier, response_cache_layer};
pub use store::{BodyStore, Clock, FsBodyStore, ManualClock, MemoryBodyStore, SystemClock};
pub use trigger::CacheTrigger;

pub(crate) use consumer::METRIC_CONSUME_MS;
pub(crate) use events::{METRIC_QUEUE_COLLAPSED, METRIC_QUEUE_LEN};
pub(crate) use interceptor::{
    METRIC_BYPASS, METRIC_HIT, METRIC_MISS, METRIC_WRITE, METRIC_WRITE_ERROR,
};
pub(crate) use invalidator::METRIC_INVALIDATED;
