//! Metrics sink.
//!
//! Every orchestration primitive reports fire-and-forget events through a
//! [`MetricsSink`]. Reporting is infallible by signature: a sink that cannot
//! deliver an event drops it.

use std::fmt;
use std::sync::Mutex;

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tracing::trace;

use crate::lock::mutex_lock;

const SOURCE: &str = "sink";

pub const METRIC_CACHE_HIT: &str = "hearth_cache_hit_total";
pub const METRIC_CACHE_STALE: &str = "hearth_cache_stale_total";
pub const METRIC_CACHE_MISS: &str = "hearth_cache_miss_total";
pub const METRIC_CACHE_ERROR: &str = "hearth_cache_error_total";
pub const METRIC_CACHE_SET: &str = "hearth_cache_set_total";
pub const METRIC_CACHE_INVALIDATE: &str = "hearth_cache_invalidate_total";
pub const METRIC_COALESCE_JOIN: &str = "hearth_coalesce_join_total";
pub const METRIC_COALESCE_DISPATCH: &str = "hearth_coalesce_dispatch_total";
pub const METRIC_COALESCE_LOCK_ACQUIRED: &str = "hearth_coalesce_lock_acquired_total";
pub const METRIC_COALESCE_LOCK_CONTENDED: &str = "hearth_coalesce_lock_contended_total";
pub const METRIC_COALESCE_REMOTE_HIT: &str = "hearth_coalesce_remote_hit_total";
pub const METRIC_COALESCE_TIMEOUT: &str = "hearth_coalesce_timeout_total";
pub const METRIC_COALESCE_LOCK_RELEASE_FAILED: &str = "hearth_coalesce_lock_release_failed_total";
pub const METRIC_BATCH_FLUSH_SIZE: &str = "hearth_batch_flush_size";
pub const METRIC_BATCH_RETRY: &str = "hearth_batch_retry_total";
pub const METRIC_BATCH_FAILURE: &str = "hearth_batch_failure_total";
pub const METRIC_BATCH_PROCESS_MS: &str = "hearth_batch_process_ms";

/// Coarse grouping of a metric event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Api,
    Auth,
    Database,
    Cache,
    Error,
    Performance,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Auth => "auth",
            Category::Database => "database",
            Category::Cache => "cache",
            Category::Error => "error",
            Category::Performance => "performance",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured event.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub category: Category,
    /// Free-form label, usually the cache or coalescing key.
    pub label: Option<String>,
    /// Measured value; events carrying one are recorded as histograms.
    pub value: Option<f64>,
    pub metadata: Map<String, Value>,
}

impl MetricEvent {
    pub fn new(name: &'static str, category: Category) -> Self {
        Self {
            name,
            category,
            label: None,
            value: None,
            metadata: Map::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for [`MetricEvent`]s.
pub trait MetricsSink: Send + Sync {
    fn report(&self, event: MetricEvent);
}

/// Forwards events to the process-wide `metrics` recorder.
///
/// The category becomes the only metric label; labels and metadata are
/// high-cardinality and go to the trace log instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn report(&self, event: MetricEvent) {
        let category = event.category.as_str();
        match event.value {
            Some(value) => histogram!(event.name, "category" => category).record(value),
            None => counter!(event.name, "category" => category).increment(1),
        }

        let metadata = Value::Object(event.metadata);
        trace!(
            metric = event.name,
            category,
            label = event.label.as_deref(),
            value = event.value,
            metadata = %metadata,
            "Metric reported"
        );
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn report(&self, _event: MetricEvent) {}
}

/// Keeps every event in memory, in report order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        mutex_lock(&self.events, SOURCE, "events").clone()
    }

    /// Number of reported events with the given name.
    pub fn count(&self, name: &str) -> usize {
        mutex_lock(&self.events, SOURCE, "count")
            .iter()
            .filter(|event| event.name == name)
            .count()
    }

    pub fn clear(&self) {
        mutex_lock(&self.events, SOURCE, "clear").clear();
    }
}

impl MetricsSink for MemorySink {
    fn report(&self, event: MetricEvent) {
        mutex_lock(&self.events, SOURCE, "report").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let event = MetricEvent::new(METRIC_CACHE_HIT, Category::Cache)
            .label("recipe:1")
            .value(12.5)
            .meta("age_ms", 40);

        assert_eq!(event.label.as_deref(), Some("recipe:1"));
        assert_eq!(event.value, Some(12.5));
        assert_eq!(event.metadata.get("age_ms"), Some(&Value::from(40)));
    }

    #[test]
    fn memory_sink_counts_by_name() {
        let sink = MemorySink::new();
        sink.report(MetricEvent::new(METRIC_CACHE_HIT, Category::Cache));
        sink.report(MetricEvent::new(METRIC_CACHE_MISS, Category::Cache));
        sink.report(MetricEvent::new(METRIC_CACHE_HIT, Category::Cache));

        assert_eq!(sink.count(METRIC_CACHE_HIT), 2);
        assert_eq!(sink.count(METRIC_CACHE_MISS), 1);
        assert_eq!(sink.events().len(), 3);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn recorder_sink_reports_counters_and_histograms() {
        RecorderSink.report(
            MetricEvent::new(METRIC_CACHE_HIT, Category::Cache)
                .label("recipe:1")
                .meta("age_ms", 40),
        );
        RecorderSink.report(
            MetricEvent::new(METRIC_BATCH_PROCESS_MS, Category::Performance)
                .value(3.5)
                .meta("size", 2),
        );
    }

    #[test]
    fn category_names_are_lowercase() {
        assert_eq!(Category::Performance.to_string(), "performance");
        assert_eq!(Category::Database.as_str(), "database");
    }
}
