use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::pipeline::{
        METRIC_ORIGIN_ERROR, METRIC_ORIGIN_FETCH, METRIC_ORIGIN_NOT_FOUND, METRIC_TRANSFORM_MS,
    },
    cache::{
        METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_NOT_MODIFIED, METRIC_CACHE_WRITE,
        METRIC_CACHE_WRITE_FAILED, METRIC_INFLIGHT_COALESCED,
    },
    config::{LogFormat, LoggingSettings},
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Safe to call
/// more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of requests served from the disk cache."
        );
        describe_counter!(
            METRIC_CACHE_NOT_MODIFIED,
            Unit::Count,
            "Total number of conditional requests answered with 304."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of disk cache misses."
        );
        describe_counter!(
            METRIC_CACHE_WRITE,
            Unit::Count,
            "Total number of cache entries written."
        );
        describe_counter!(
            METRIC_CACHE_WRITE_FAILED,
            Unit::Count,
            "Total number of cache writes that failed and were discarded."
        );
        describe_counter!(
            METRIC_ORIGIN_FETCH,
            Unit::Count,
            "Total number of origin fetches."
        );
        describe_counter!(
            METRIC_ORIGIN_NOT_FOUND,
            Unit::Count,
            "Total number of origin fetches for missing objects."
        );
        describe_counter!(
            METRIC_ORIGIN_ERROR,
            Unit::Count,
            "Total number of failed origin fetches, including mid-body failures."
        );
        describe_histogram!(
            METRIC_TRANSFORM_MS,
            Unit::Milliseconds,
            "Image transform latency in milliseconds."
        );
        describe_counter!(
            METRIC_INFLIGHT_COALESCED,
            Unit::Count,
            "Total number of image misses that joined an in-flight render."
        );
    });
}
