//! Operator HTTP surface.

mod admin;
mod middleware;

pub use admin::{AdminState, InvalidateQuery, StatsResponse, build_admin_router};
pub use middleware::log_responses;
