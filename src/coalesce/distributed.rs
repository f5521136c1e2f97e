//! Cross-process coalescing through an advisory lock in the shared store.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::sink::{
    Category, METRIC_COALESCE_LOCK_ACQUIRED, METRIC_COALESCE_LOCK_CONTENDED,
    METRIC_COALESCE_LOCK_RELEASE_FAILED, METRIC_COALESCE_REMOTE_HIT, METRIC_COALESCE_TIMEOUT,
    MetricEvent, MetricsSink,
};
use crate::store::{SetOptions, SharedStore, StoreError};

use super::config::{CoalesceConfig, DistributedOptions};

/// Failure of a distributed coalesce call.
#[derive(Debug, Error)]
pub enum CoalesceError<E> {
    /// The coalesced work itself failed.
    #[error("coalesced operation failed: {0}")]
    Operation(E),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode or decode coalesced result: {0}")]
    Codec(#[from] serde_json::Error),
    /// The lock stayed held and no result appeared within the allowed waits.
    #[error("timed out waiting for coalesced result of `{key}`")]
    Timeout { key: String },
}

/// Deduplicates expensive work across processes sharing one store.
///
/// The first caller to take `"{lock_prefix}{key}"` runs the work and
/// publishes its JSON result under `key`; everyone else waits
/// `options.timeout` and reads that result. The lock is advisory and always
/// released by its holder, whatever the outcome.
#[derive(Clone)]
pub struct DistributedCoalescer {
    store: Arc<dyn SharedStore>,
    sink: Arc<dyn MetricsSink>,
    lock_prefix: String,
}

impl DistributedCoalescer {
    pub fn new(
        store: Arc<dyn SharedStore>,
        sink: Arc<dyn MetricsSink>,
        config: &CoalesceConfig,
    ) -> Self {
        Self {
            store,
            sink,
            lock_prefix: config.lock_prefix.clone(),
        }
    }

    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{key}", self.lock_prefix)
    }

    #[instrument(skip(self, work, options))]
    pub async fn coalesce<T, E, F, Fut>(
        &self,
        key: &str,
        work: F,
        options: &DistributedOptions,
    ) -> Result<T, CoalesceError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lock_key = self.lock_key(key);
        let mut attempt = 0;

        loop {
            let token = Uuid::new_v4().to_string();
            let acquired = self
                .store
                .set(&lock_key, &token, SetOptions::absent_with_expiry(options.lock_ttl))
                .await?;

            if acquired {
                debug!(key, attempt, token = %token, "Coalesce lock acquired");
                self.sink.report(
                    MetricEvent::new(METRIC_COALESCE_LOCK_ACQUIRED, Category::Performance)
                        .label(key)
                        .meta("attempt", attempt)
                        .meta("token", token.as_str()),
                );
                return self.run_locked(key, &lock_key, &token, work, options).await;
            }

            debug!(
                key,
                attempt,
                wait_ms = options.timeout.as_millis() as u64,
                "Coalesce lock held elsewhere; waiting"
            );
            self.sink.report(
                MetricEvent::new(METRIC_COALESCE_LOCK_CONTENDED, Category::Performance)
                    .label(key)
                    .meta("attempt", attempt),
            );
            tokio::time::sleep(options.timeout).await;

            if let Some(raw) = self.store.get(key).await? {
                debug!(key, "Coalesced result published by lock holder");
                self.sink.report(
                    MetricEvent::new(METRIC_COALESCE_REMOTE_HIT, Category::Performance).label(key),
                );
                return Ok(serde_json::from_str(&raw)?);
            }

            if attempt >= options.lock_retries {
                warn!(
                    key,
                    attempts = attempt + 1,
                    "No coalesced result after waiting; giving up"
                );
                self.sink.report(
                    MetricEvent::new(METRIC_COALESCE_TIMEOUT, Category::Error)
                        .label(key)
                        .meta("attempts", attempt + 1),
                );
                return Err(CoalesceError::Timeout {
                    key: key.to_string(),
                });
            }
            attempt += 1;
        }
    }

    async fn run_locked<T, E, F, Fut>(
        &self,
        key: &str,
        lock_key: &str,
        token: &str,
        work: F,
        options: &DistributedOptions,
    ) -> Result<T, CoalesceError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = match work().await {
            Ok(value) => self.publish(key, &value, options).await.map(|()| value),
            Err(err) => Err(CoalesceError::Operation(err)),
        };

        self.release(key, lock_key, token).await;
        outcome
    }

    async fn publish<T: Serialize, E>(
        &self,
        key: &str,
        value: &T,
        options: &DistributedOptions,
    ) -> Result<(), CoalesceError<E>> {
        let raw = serde_json::to_string(value)?;
        self.store
            .set(key, &raw, SetOptions::expire_in(options.lock_ttl))
            .await?;
        Ok(())
    }

    async fn release(&self, key: &str, lock_key: &str, token: &str) {
        match self.store.del(&[lock_key.to_string()]).await {
            Ok(_) => debug!(key, token, "Coalesce lock released"),
            Err(err) => {
                warn!(
                    key,
                    token,
                    error = %err,
                    "Coalesce lock release failed; it expires by TTL"
                );
                self.sink.report(
                    MetricEvent::new(METRIC_COALESCE_LOCK_RELEASE_FAILED, Category::Error)
                        .label(key)
                        .meta("token", token)
                        .meta("error", err.to_string()),
                );
            }
        }
    }
}
