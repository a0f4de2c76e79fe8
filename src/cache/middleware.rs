//! Page cache middleware for axum.
//!
//! Wraps the host router: eligible GET requests are answered from the cache
//! when a fresh entry exists, otherwise the handler runs and a `200` body is
//! captured on the way out.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{HeaderMap, Request, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use tracing::{instrument, warn};

use super::deps::DependencyRecorder;
use super::gate::{HostStatus, RequestContext};
use super::interceptor::{CachedPage, Lookup, PageCache};
use super::keys::{RequestIdentity, SiteId};

/// Flags the middleware derives from request paths, query and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestClassifier {
    pub admin_prefix: String,
    pub action_prefix: String,
    pub action_param: String,
    pub preview_param: String,
    pub preview_header: String,
    pub site_header: String,
    pub default_site: SiteId,
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self {
            admin_prefix: "/admin".to_string(),
            action_prefix: "/actions/".to_string(),
            action_param: "action".to_string(),
            preview_param: "preview".to_string(),
            preview_header: "x-preview".to_string(),
            site_header: "x-site-id".to_string(),
            default_site: SiteId(1),
        }
    }
}

impl From<&crate::config::RoutingSettings> for RequestClassifier {
    fn from(settings: &crate::config::RoutingSettings) -> Self {
        Self {
            admin_prefix: settings.admin_prefix.clone(),
            action_prefix: settings.action_prefix.clone(),
            action_param: settings.action_param.clone(),
            preview_param: settings.preview_param.clone(),
            preview_header: settings.preview_header.clone(),
            site_header: settings.site_header.clone(),
            default_site: SiteId(settings.default_site_id),
        }
    }
}

impl RequestClassifier {
    /// Build the cache's view of `request`.
    pub fn classify<B>(&self, request: &Request<B>, host: HostStatus) -> RequestContext {
        let uri = request.uri();
        let path = uri.path();
        let query = uri.query();
        let headers = request.headers();

        RequestContext {
            method: request.method().clone(),
            identity: RequestIdentity::from_parts(path, query, self.site_id(headers)),
            is_admin: has_path_prefix(path, &self.admin_prefix),
            is_action: path.starts_with(&self.action_prefix)
                || has_query_param(query, &self.action_param),
            is_preview: has_query_param(query, &self.preview_param)
                || headers.contains_key(self.preview_header.as_str()),
            host,
        }
    }

    fn site_id(&self, headers: &HeaderMap) -> SiteId {
        headers
            .get(self.site_header.as_str())
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i32>().ok())
            .map(SiteId)
            .unwrap_or(self.default_site)
    }
}

/// `prefix` matches itself and anything below it, but not `/administer`.
fn has_path_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn has_query_param(query: Option<&str>, name: &str) -> bool {
    query.is_some_and(|query| {
        query
            .split('&')
            .any(|pair| pair.split('=').next() == Some(name))
    })
}

/// Host status switches, flipped at runtime (maintenance mode).
#[derive(Debug)]
pub struct HostState {
    dev_mode: AtomicBool,
    system_on: AtomicBool,
}

impl HostState {
    pub fn new(status: HostStatus) -> Self {
        Self {
            dev_mode: AtomicBool::new(status.dev_mode),
            system_on: AtomicBool::new(status.system_on),
        }
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            dev_mode: self.dev_mode.load(Ordering::Relaxed),
            system_on: self.system_on.load(Ordering::Relaxed),
        }
    }

    pub fn set_system_on(&self, on: bool) {
        self.system_on.store(on, Ordering::Relaxed);
    }

    pub fn set_dev_mode(&self, on: bool) {
        self.dev_mode.store(on, Ordering::Relaxed);
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new(HostStatus::default())
    }
}

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub cache: Arc<PageCache>,
    pub classifier: Arc<RequestClassifier>,
    pub host: Arc<HostState>,
}

impl CacheState {
    pub fn new(cache: Arc<PageCache>, classifier: RequestClassifier, host: Arc<HostState>) -> Self {
        Self {
            cache,
            classifier: Arc::new(classifier),
            host,
        }
    }

    /// State wired from the `[routing]` and `[host]` tables.
    pub fn from_settings(cache: Arc<PageCache>, settings: &crate::config::Settings) -> Self {
        let host = HostState::new(HostStatus {
            dev_mode: settings.host.dev_mode,
            system_on: settings.host.system_on,
        });
        Self::new(
            cache,
            RequestClassifier::from(&settings.routing),
            Arc::new(host),
        )
    }
}

/// Middleware for full-page caching.
///
/// Handlers record their content units through the [`DependencyRecorder`]
/// extractor. A recorder is always present; on a bypass it is simply
/// discarded.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let context = state.classifier.classify(&request, state.host.status());

    let capture = match state.cache.lookup(&context).await {
        Lookup::Hit(page) => return cached_response(page),
        Lookup::Bypass => {
            request.extensions_mut().insert(DependencyRecorder::new());
            return next.run(request).await;
        }
        Lookup::Miss(capture) => capture,
    };

    request.extensions_mut().insert(capture.recorder().clone());
    let response = next.run(request).await;

    // Non-200 responses never reach the store; leave their bodies streaming.
    if response.status() != StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to collect response body for page cache");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let bytes = state
        .cache
        .complete(capture, &context, parts.status, bytes)
        .await;
    Response::from_parts(parts, Body::from(bytes))
}

/// Build a response from a cached page.
fn cached_response(page: CachedPage) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, page.content_type())
        .body(Body::from(page.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

impl<S> FromRequestParts<S> for DependencyRecorder
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<DependencyRecorder>()
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;

    fn classify(builder: axum::http::request::Builder) -> RequestContext {
        let request = builder.body(Body::empty()).unwrap();
        RequestClassifier::default().classify(&request, HostStatus::default())
    }

    #[test]
    fn plain_get_is_public() {
        let ctx = classify(Request::builder().uri("/blog/hello?page=2"));
        assert_eq!(ctx.method, Method::GET);
        assert_eq!(ctx.identity, RequestIdentity::new("/blog/hello?page=2", SiteId(1)));
        assert!(!ctx.is_admin && !ctx.is_action && !ctx.is_preview);
    }

    #[test]
    fn admin_prefix_matches_whole_segments() {
        assert!(classify(Request::builder().uri("/admin")).is_admin);
        assert!(classify(Request::builder().uri("/admin/entries")).is_admin);
        assert!(!classify(Request::builder().uri("/administer")).is_admin);
    }

    #[test]
    fn action_detected_by_prefix_or_param() {
        assert!(classify(Request::builder().uri("/actions/users/login")).is_action);
        assert!(classify(Request::builder().uri("/?action=users/login")).is_action);
        assert!(!classify(Request::builder().uri("/?transaction=1")).is_action);
    }

    #[test]
    fn preview_detected_by_param_or_header() {
        assert!(classify(Request::builder().uri("/post?preview=1")).is_preview);
        assert!(classify(Request::builder().uri("/post").header("x-preview", "1")).is_preview);
    }

    #[test]
    fn site_header_overrides_default() {
        let ctx = classify(Request::builder().uri("/").header("x-site-id", "7"));
        assert_eq!(ctx.identity.site_id, SiteId(7));

        let ctx = classify(Request::builder().uri("/").header("x-site-id", "nope"));
        assert_eq!(ctx.identity.site_id, SiteId(1));
    }

    #[test]
    fn host_state_reflects_toggles() {
        let host = HostState::default();
        assert!(host.status().system_on);
        host.set_system_on(false);
        host.set_dev_mode(true);
        assert_eq!(
            host.status(),
            HostStatus {
                dev_mode: true,
                system_on: false
            }
        );
    }
}
