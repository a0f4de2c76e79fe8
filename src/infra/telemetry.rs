use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter,
    filter::Directive,
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Filter directives read from this variable override the configured level.
pub const LOG_FILTER_ENV: &str = "PAGECACHE_LOG";

/// Query logging from the pool is noisy at `info`; keep it at `warn` unless
/// the filter variable asks otherwise.
const QUIET_DIRECTIVES: &[&str] = &["sqlx=warn", "hyper=warn"];

/// Install the process-wide subscriber and register metric descriptions.
///
/// Fails when a subscriber is already installed.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let filter = build_filter(logging.level, std::env::var(LOG_FILTER_ENV).ok().as_deref())?;

    let output = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(output)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

/// Configured level plus the quiet defaults, then any explicit directives.
fn build_filter(level: LevelFilter, overrides: Option<&str>) -> Result<EnvFilter, InfraError> {
    let mut filter = EnvFilter::builder()
        .parse(level.to_string())
        .map_err(|err| InfraError::telemetry(format!("invalid log level `{level}`: {err}")))?;
    for directive in QUIET_DIRECTIVES {
        filter = filter.add_directive(parse_directive(directive)?);
    }
    for directive in overrides
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        filter = filter.add_directive(parse_directive(directive)?);
    }
    Ok(filter)
}

fn parse_directive(directive: &str) -> Result<Directive, InfraError> {
    directive
        .parse()
        .map_err(|err| InfraError::telemetry(format!("invalid log directive `{directive}`: {err}")))
}

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            cache::METRIC_HIT,
            Unit::Count,
            "Total number of requests answered from the page cache."
        );
        describe_counter!(
            cache::METRIC_MISS,
            Unit::Count,
            "Total number of eligible requests that had to be rendered, by reason."
        );
        describe_counter!(
            cache::METRIC_BYPASS,
            Unit::Count,
            "Total number of requests excluded from the page cache, by rule."
        );
        describe_counter!(
            cache::METRIC_WRITE,
            Unit::Count,
            "Total number of page bodies stored."
        );
        describe_counter!(
            cache::METRIC_WRITE_ERROR,
            Unit::Count,
            "Total number of page cache writes that failed."
        );
        describe_counter!(
            cache::METRIC_INVALIDATED,
            Unit::Count,
            "Total number of page cache entries invalidated, by scope."
        );
        describe_gauge!(
            cache::METRIC_QUEUE_LEN,
            Unit::Count,
            "Current number of pending cache events in the queue."
        );
        describe_counter!(
            cache::METRIC_QUEUE_COLLAPSED,
            Unit::Count,
            "Total number of times a full event queue was collapsed into a flush."
        );
        describe_histogram!(
            cache::METRIC_CONSUME_MS,
            Unit::Milliseconds,
            "Cache event consumption latency in milliseconds."
        );
    });
}
