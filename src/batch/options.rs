use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_WAIT_MS: u64 = 50;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Flush thresholds and retry policy of a [`BatchProcessor`](super::BatchProcessor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Queue length that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Longest an item waits before a timed flush picks it up.
    pub max_wait_ms: u64,
    /// Calls to the batch function before giving up, first call included.
    pub retry_attempts: u32,
    /// Base of the linear backoff: attempt `n` is followed by `n * retry_delay`.
    pub retry_delay_ms: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl From<&crate::config::BatchSettings> for BatchOptions {
    fn from(settings: &crate::config::BatchSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size.get(),
            max_wait_ms: settings.max_wait_ms,
            retry_attempts: settings.retry_attempts.get(),
            retry_delay_ms: settings.retry_delay_ms,
        }
    }
}

impl BatchOptions {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Pause after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// A batch is always tried at least once.
    pub(crate) fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    /// A zero size behaves like one: every item flushes on its own.
    pub(crate) fn batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = BatchOptions::default();
        assert_eq!(options.max_batch_size, 100);
        assert_eq!(options.max_wait(), Duration::from_millis(50));
        assert_eq!(options.attempts(), 3);
    }

    #[test]
    fn backoff_is_linear() {
        let options = BatchOptions::default();
        assert_eq!(options.backoff(1), Duration::from_millis(100));
        assert_eq!(options.backoff(2), Duration::from_millis(200));
        assert_eq!(options.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn degenerate_values_are_clamped() {
        let options = BatchOptions {
            max_batch_size: 0,
            retry_attempts: 0,
            ..Default::default()
        };
        assert_eq!(options.batch_size(), 1);
        assert_eq!(options.attempts(), 1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let options: BatchOptions =
            serde_json::from_value(serde_json::json!({ "max_batch_size": 8 })).expect("decode");
        assert_eq!(options.max_batch_size, 8);
        assert_eq!(options.retry_delay_ms, 100);
    }
}
