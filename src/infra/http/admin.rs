//! Cache administration endpoints: flush, invalidate, sweep, stats, health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::error::{AppError, ErrorReport};
use crate::cache::{CacheTrigger, ContentUnitId, InvalidationReport, PageCache, SweepReport};

use super::middleware::log_responses;

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<PageCache>,
    pub trigger: Arc<CacheTrigger>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateQuery {
    /// Queue the change for the background consumer instead of applying it now.
    #[serde(default)]
    pub defer: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub entries: u64,
    pub queue_len: usize,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cache/flush", post(flush))
        .route("/cache/sweep", post(sweep))
        .route("/cache/stats", get(stats))
        .route("/cache/content/{unit}/invalidate", post(invalidate))
        .layer(middleware::from_fn(log_responses))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> Response {
    match state.cache.index().entry_count().await {
        Ok(_) => (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::admin::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

async fn flush(State(state): State<AdminState>) -> Result<StatusCode, AppError> {
    state.cache.invalidator().clear_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate(
    State(state): State<AdminState>,
    Path(unit): Path<String>,
    Query(query): Query<InvalidateQuery>,
) -> Result<Response, AppError> {
    let unit = unit.trim();
    if unit.is_empty() {
        return Err(AppError::validation("content unit id must not be empty"));
    }
    let unit = ContentUnitId::new(unit);

    if query.defer {
        state.trigger.content_unit_changed(unit, false).await;
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let report: InvalidationReport = state
        .cache
        .invalidator()
        .on_content_unit_changed(&unit)
        .await?;
    Ok(Json(report).into_response())
}

async fn sweep(State(state): State<AdminState>) -> Result<Json<SweepReport>, AppError> {
    let duration = state.cache.config().effective_duration().await;
    let report = state.cache.invalidator().sweep(duration).await?;
    info!(
        expired_removed = report.expired_removed,
        orphans_removed = report.orphans_removed,
        "Sweep requested via admin surface"
    );
    Ok(Json(report))
}

async fn stats(State(state): State<AdminState>) -> Result<Json<StatsResponse>, AppError> {
    let entries = state.cache.index().entry_count().await?;
    Ok(Json(StatsResponse {
        entries,
        queue_len: state.trigger.queue().len(),
    }))
}
