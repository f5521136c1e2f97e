//! Tagged, stale-while-revalidate cache over the shared store.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::sink::{
    Category, METRIC_CACHE_ERROR, METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATE, METRIC_CACHE_MISS,
    METRIC_CACHE_SET, METRIC_CACHE_STALE, MetricEvent, MetricsSink,
};
use crate::store::{SetOptions, SharedStore, StoreError};

use super::config::CacheConfig;
use super::entry::{CacheEntry, CacheLookup, CacheOptions, Freshness};

/// Result of [`TaggedCache::invalidate_by_tag`].
///
/// Deletion is key by key with no rollback. The tag index is only dropped
/// once every key it listed is gone, so invalidating the same tag again
/// retries the keys that failed.
#[derive(Debug, Clone)]
pub struct InvalidationReport {
    pub tag: String,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, StoreError)>,
    pub index_removed: bool,
}

impl InvalidationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.index_removed
    }
}

/// Read/write/invalidate cache with TTL, stale window and tag index.
///
/// Reads and writes fail open: a store or codec failure is logged, reported
/// to the sink and then treated as a miss (reads) or a skipped write (writes).
#[derive(Clone)]
pub struct TaggedCache {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    config: CacheConfig,
}

impl TaggedCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Options carrying the configured defaults.
    pub fn options(&self) -> CacheOptions {
        self.config.default_options()
    }

    /// Reads `key` and classifies it against `options`.
    #[instrument(skip(self, options))]
    pub async fn lookup<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &CacheOptions,
    ) -> CacheLookup<T> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.report_miss(key, "absent");
                return CacheLookup::Miss;
            }
            Err(err) => {
                self.report_error(key, "get", &err.to_string());
                self.report_miss(key, "error");
                return CacheLookup::Miss;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                self.report_error(key, "decode", &err.to_string());
                self.report_miss(key, "error");
                return CacheLookup::Miss;
            }
        };

        let age = entry.age_millis(self.clock.now_millis());
        match options.freshness(age) {
            Freshness::Fresh => {
                debug!(key, age_ms = age, "Cache hit");
                self.sink.report(
                    MetricEvent::new(METRIC_CACHE_HIT, Category::Cache)
                        .label(key)
                        .meta("age_ms", age),
                );
                CacheLookup::Fresh(entry.data)
            }
            Freshness::Stale => {
                debug!(key, age_ms = age, "Cache hit (stale)");
                self.sink.report(
                    MetricEvent::new(METRIC_CACHE_STALE, Category::Cache)
                        .label(key)
                        .meta("age_ms", age),
                );
                CacheLookup::Stale(entry.data)
            }
            Freshness::Expired => {
                self.report_miss(key, "expired");
                CacheLookup::Miss
            }
        }
    }

    /// Fresh or stale data for `key`, `None` otherwise.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        self.lookup(key, options).await.into_value()
    }

    /// Writes `data` under `key` (last write wins) and adds `key` to the index
    /// of every tag in `options`.
    #[instrument(skip(self, data, options))]
    pub async fn set<T: Serialize>(&self, key: &str, data: &T, options: &CacheOptions) {
        let timestamp = self.clock.now_millis();
        let raw = match serde_json::to_string(&CacheEntry::new(
            data,
            timestamp,
            options.tags.iter().cloned(),
        )) {
            Ok(raw) => raw,
            Err(err) => {
                self.report_error(key, "encode", &err.to_string());
                return;
            }
        };

        let write = SetOptions::expire_in(options.store_expiry());
        if let Err(err) = self.store.set(key, &raw, write).await {
            self.report_error(key, "set", &err.to_string());
            return;
        }

        // A tag index lives as long as the longest-lived entry it lists.
        for tag in &options.tags {
            let index = self.config.tag_index_key(tag);
            if let Err(err) = self.store.sadd(&index, key).await {
                self.report_error(key, "tag_index", &err.to_string());
                continue;
            }
            if let Err(err) = self
                .store
                .extend_expiry(&index, options.store_expiry())
                .await
            {
                self.report_error(key, "tag_index_expiry", &err.to_string());
            }
        }

        debug!(key, tags = ?options.tags, "Cache entry written");
        self.sink.report(
            MetricEvent::new(METRIC_CACHE_SET, Category::Cache)
                .label(key)
                .meta("tags", options.tags.len()),
        );
    }

    /// Deletes every key indexed under `tag`, best effort.
    ///
    /// Fails only when the tag index itself cannot be read.
    #[instrument(skip(self))]
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<InvalidationReport, StoreError> {
        let index = self.config.tag_index_key(tag);
        let keys = self.store.smembers(&index).await.inspect_err(|err| {
            self.report_error(tag, "tag_members", &err.to_string());
        })?;

        let mut report = InvalidationReport {
            tag: tag.to_string(),
            deleted: Vec::with_capacity(keys.len()),
            failed: Vec::new(),
            index_removed: false,
        };

        for key in keys {
            match self.store.del(std::slice::from_ref(&key)).await {
                Ok(_) => report.deleted.push(key),
                Err(err) => {
                    self.report_error(&key, "invalidate", &err.to_string());
                    report.failed.push((key, err));
                }
            }
        }

        if report.failed.is_empty() {
            match self.store.del(&[index]).await {
                Ok(_) => report.index_removed = true,
                Err(err) => self.report_error(tag, "tag_index_delete", &err.to_string()),
            }
        } else {
            warn!(
                tag,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Partial tag invalidation; tag index retained"
            );
        }

        self.sink.report(
            MetricEvent::new(METRIC_CACHE_INVALIDATE, Category::Cache)
                .label(tag)
                .meta("deleted", report.deleted.len())
                .meta("failed", report.failed.len()),
        );
        Ok(report)
    }

    fn report_miss(&self, key: &str, reason: &'static str) {
        debug!(key, reason, "Cache miss");
        self.sink.report(
            MetricEvent::new(METRIC_CACHE_MISS, Category::Cache)
                .label(key)
                .meta("reason", reason),
        );
    }

    fn report_error(&self, key: &str, op: &'static str, message: &str) {
        warn!(key, op, error = message, "Cache operation failed; failing open");
        self.sink.report(
            MetricEvent::new(METRIC_CACHE_ERROR, Category::Error)
                .label(key)
                .meta("op", op)
                .meta("error", message),
        );
    }
}
