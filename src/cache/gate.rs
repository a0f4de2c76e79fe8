//! Eligibility gate.
//!
//! Decides whether a request may read or write the page cache. The same
//! predicate runs on the read path (no status yet) and the write path (final
//! status known) so a request type can never populate entries it could not
//! later be served from.

use axum::http::{Method, StatusCode};

use super::config::CacheConfig;
use super::keys::RequestIdentity;

/// Runtime state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStatus {
    /// Host runs with development/debug behavior enabled.
    pub dev_mode: bool,
    /// Host is online; false while in maintenance mode.
    pub system_on: bool,
}

impl Default for HostStatus {
    fn default() -> Self {
        Self {
            dev_mode: false,
            system_on: true,
        }
    }
}

/// Everything the cache needs to know about an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub identity: RequestIdentity,
    /// Targets the administrative/control surface.
    pub is_admin: bool,
    /// Targets an internal action/command endpoint.
    pub is_action: bool,
    /// Preview or draft rendering.
    pub is_preview: bool,
    pub host: HostStatus,
}

impl RequestContext {
    /// A plain public GET for `identity` on a running production host.
    pub fn get(identity: RequestIdentity) -> Self {
        Self {
            method: Method::GET,
            identity,
            is_admin: false,
            is_action: false,
            is_preview: false,
            host: HostStatus::default(),
        }
    }
}

/// First rule that excluded a request from caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    DevMode,
    Disabled,
    SystemOff,
    AdminSurface,
    ActionEndpoint,
    Preview,
    Method,
    Status,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::DevMode => "dev_mode",
            Rejection::Disabled => "disabled",
            Rejection::SystemOff => "system_off",
            Rejection::AdminSurface => "admin_surface",
            Rejection::ActionEndpoint => "action_endpoint",
            Rejection::Preview => "preview",
            Rejection::Method => "method",
            Rejection::Status => "status",
        }
    }
}

/// Returns the rule rejecting this request, or `None` when it may use the cache.
///
/// `status` is `None` on the read path; on the write path only `200 OK` passes.
pub fn rejection(
    request: &RequestContext,
    config: &CacheConfig,
    status: Option<StatusCode>,
) -> Option<Rejection> {
    if request.host.dev_mode && !config.force_on {
        return Some(Rejection::DevMode);
    }
    if !config.enabled {
        return Some(Rejection::Disabled);
    }
    if !request.host.system_on && !config.force_on {
        return Some(Rejection::SystemOff);
    }
    if request.is_admin {
        return Some(Rejection::AdminSurface);
    }
    if request.is_action {
        return Some(Rejection::ActionEndpoint);
    }
    if request.is_preview {
        return Some(Rejection::Preview);
    }
    if request.method != Method::GET {
        return Some(Rejection::Method);
    }
    match status {
        Some(status) if status != StatusCode::OK => Some(Rejection::Status),
        _ => None,
    }
}

/// Whether the request may read (no status) or write (with status) the cache.
pub fn is_cacheable(
    request: &RequestContext,
    config: &CacheConfig,
    status: Option<StatusCode>,
) -> bool {
    rejection(request, config, status).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::SiteId;

    fn request() -> RequestContext {
        RequestContext::get(RequestIdentity::new("/blog/post-1", SiteId(1)))
    }

    #[test]
    fn public_get_is_cacheable() {
        let config = CacheConfig::default();
        assert!(is_cacheable(&request(), &config, None));
        assert!(is_cacheable(&request(), &config, Some(StatusCode::OK)));
    }

    #[test]
    fn dev_mode_blocks_unless_forced() {
        let mut req = request();
        req.host.dev_mode = true;

        let config = CacheConfig::default();
        assert_eq!(rejection(&req, &config, None), Some(Rejection::DevMode));

        let forced = CacheConfig {
            force_on: true,
            ..Default::default()
        };
        assert!(is_cacheable(&req, &forced, None));
    }

    #[test]
    fn system_off_blocks_unless_forced() {
        let mut req = request();
        req.host.system_on = false;

        let config = CacheConfig::default();
        assert_eq!(rejection(&req, &config, None), Some(Rejection::SystemOff));

        let forced = CacheConfig {
            force_on: true,
            ..Default::default()
        };
        assert!(is_cacheable(&req, &forced, None));
    }

    #[test]
    fn force_on_does_not_override_disabled() {
        let config = CacheConfig {
            enabled: false,
            force_on: true,
            ..Default::default()
        };
        assert_eq!(rejection(&request(), &config, None), Some(Rejection::Disabled));
    }

    #[test]
    fn admin_action_and_preview_are_rejected() {
        let config = CacheConfig::default();

        let mut admin = request();
        admin.is_admin = true;
        assert_eq!(rejection(&admin, &config, None), Some(Rejection::AdminSurface));

        let mut action = request();
        action.is_action = true;
        assert_eq!(
            rejection(&action, &config, None),
            Some(Rejection::ActionEndpoint)
        );

        let mut preview = request();
        preview.is_preview = true;
        assert_eq!(rejection(&preview, &config, None), Some(Rejection::Preview));
    }

    #[test]
    fn non_get_methods_are_rejected() {
        let config = CacheConfig::default();
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            let mut req = request();
            req.method = method;
            assert_eq!(rejection(&req, &config, None), Some(Rejection::Method));
        }
    }

    #[test]
    fn write_path_requires_exactly_ok() {
        let config = CacheConfig::default();
        for status in [
            StatusCode::CREATED,
            StatusCode::NO_CONTENT,
            StatusCode::MOVED_PERMANENTLY,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert_eq!(
                rejection(&request(), &config, Some(status)),
                Some(Rejection::Status),
                "status {status} must not be cached"
            );
        }
    }
}
