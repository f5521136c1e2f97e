use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::sink::{
    METRIC_BATCH_FAILURE, METRIC_BATCH_FLUSH_SIZE, METRIC_BATCH_PROCESS_MS, METRIC_BATCH_RETRY,
    METRIC_CACHE_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATE, METRIC_CACHE_MISS,
    METRIC_CACHE_SET, METRIC_CACHE_STALE, METRIC_COALESCE_DISPATCH, METRIC_COALESCE_JOIN,
    METRIC_COALESCE_LOCK_ACQUIRED, METRIC_COALESCE_LOCK_CONTENDED,
    METRIC_COALESCE_LOCK_RELEASE_FAILED, METRIC_COALESCE_REMOTE_HIT, METRIC_COALESCE_TIMEOUT,
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

/// Register units and help text for every metric the crate emits. Runs once
/// per process; later calls are no-ops.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Cache reads served fresh data."
        );
        describe_counter!(
            METRIC_CACHE_STALE,
            Unit::Count,
            "Cache reads served data inside the stale window."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Cache reads that found nothing usable."
        );
        describe_counter!(
            METRIC_CACHE_ERROR,
            Unit::Count,
            "Store or codec failures absorbed by the cache."
        );
        describe_counter!(METRIC_CACHE_SET, Unit::Count, "Cache entries written.");
        describe_counter!(
            METRIC_CACHE_INVALIDATE,
            Unit::Count,
            "Tag invalidations performed."
        );
        describe_counter!(
            METRIC_COALESCE_JOIN,
            Unit::Count,
            "Callers that joined an in-flight request."
        );
        describe_counter!(
            METRIC_COALESCE_DISPATCH,
            Unit::Count,
            "Requests dispatched as fresh work."
        );
        describe_counter!(
            METRIC_COALESCE_LOCK_ACQUIRED,
            Unit::Count,
            "Distributed coalescing locks acquired."
        );
        describe_counter!(
            METRIC_COALESCE_LOCK_CONTENDED,
            Unit::Count,
            "Distributed coalescing attempts that found the lock held."
        );
        describe_counter!(
            METRIC_COALESCE_REMOTE_HIT,
            Unit::Count,
            "Results read from another lock holder."
        );
        describe_counter!(
            METRIC_COALESCE_TIMEOUT,
            Unit::Count,
            "Distributed coalescing calls that gave up waiting for a result."
        );
        describe_counter!(
            METRIC_COALESCE_LOCK_RELEASE_FAILED,
            Unit::Count,
            "Coalescing locks left to expire because release failed."
        );
        describe_histogram!(
            METRIC_BATCH_FLUSH_SIZE,
            Unit::Count,
            "Items per flushed batch."
        );
        describe_counter!(
            METRIC_BATCH_RETRY,
            Unit::Count,
            "Batch attempts that failed and were retried."
        );
        describe_counter!(
            METRIC_BATCH_FAILURE,
            Unit::Count,
            "Batches rejected after exhausting retries."
        );
        describe_histogram!(
            METRIC_BATCH_PROCESS_MS,
            Unit::Milliseconds,
            "Batch processing latency in milliseconds, retries included."
        );
    });
}
