//! Coalescer configuration.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_WINDOW_MS: u64 = 10;
const DEFAULT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_REF_COUNT: u32 = 100;
const DEFAULT_CLEANUP_DELAY_MS: u64 = 100;
const DEFAULT_LOCK_TTL_SECS: u64 = 30;
const DEFAULT_LOCK_WAIT_MS: u64 = 5000;
const DEFAULT_LOCK_RETRIES: u32 = 1;
const DEFAULT_LOCK_PREFIX: &str = "lock:";

/// Settings for both coalescer flavours, from the `[coalesce]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Pause before registering fresh work, so near-simultaneous callers
    /// land on the same dispatch.
    pub window_ms: u64,
    /// How long a pending request stays joinable.
    pub timeout_ms: u64,
    /// Callers (including the dispatcher) allowed to share one request.
    pub max_ref_count: u32,
    /// Delay between settlement and removal from the pending table.
    pub cleanup_delay_ms: u64,
    pub lock_ttl_secs: u64,
    /// How long a caller that lost the lock race waits for the result.
    pub lock_wait_ms: u64,
    /// Extra lock attempts after a wait that found no result.
    pub lock_retries: u32,
    pub lock_prefix: String,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_ref_count: DEFAULT_MAX_REF_COUNT,
            cleanup_delay_ms: DEFAULT_CLEANUP_DELAY_MS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
        }
    }
}

impl From<&crate::config::CoalesceSettings> for CoalesceConfig {
    fn from(settings: &crate::config::CoalesceSettings) -> Self {
        Self {
            window_ms: settings.window_ms,
            timeout_ms: settings.timeout_ms,
            max_ref_count: settings.max_ref_count.get(),
            cleanup_delay_ms: settings.cleanup_delay_ms,
            lock_ttl_secs: settings.lock_ttl_secs.get(),
            lock_wait_ms: settings.lock_wait_ms,
            lock_retries: settings.lock_retries,
            lock_prefix: settings.lock_prefix.clone(),
        }
    }
}

impl CoalesceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn local_options(&self) -> CoalesceOptions {
        CoalesceOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            max_ref_count: self.max_ref_count,
        }
    }

    pub fn distributed_options(&self) -> DistributedOptions {
        DistributedOptions {
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            timeout: Duration::from_millis(self.lock_wait_ms),
            lock_retries: self.lock_retries,
        }
    }
}

/// Per-call options for [`Coalescer::coalesce`](super::Coalescer::coalesce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceOptions {
    /// A pending request older than this is not joined.
    pub timeout: Duration,
    pub max_ref_count: u32,
}

impl Default for CoalesceOptions {
    fn default() -> Self {
        CoalesceConfig::default().local_options()
    }
}

/// Per-call options for
/// [`DistributedCoalescer::coalesce`](super::DistributedCoalescer::coalesce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedOptions {
    /// Lock expiry, also used as the expiry of the published result.
    pub lock_ttl: Duration,
    /// Wait before a caller that lost the lock race reads the result.
    pub timeout: Duration,
    pub lock_retries: u32,
}

impl Default for DistributedOptions {
    fn default() -> Self {
        CoalesceConfig::default().distributed_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CoalesceConfig::default();
        assert_eq!(config.window(), Duration::from_millis(10));
        assert_eq!(config.cleanup_delay(), Duration::from_millis(100));

        let local = config.local_options();
        assert_eq!(local.timeout, Duration::from_secs(5));
        assert_eq!(local.max_ref_count, 100);

        let distributed = config.distributed_options();
        assert_eq!(distributed.lock_ttl, Duration::from_secs(30));
        assert_eq!(distributed.timeout, Duration::from_secs(5));
        assert_eq!(distributed.lock_retries, 1);
    }

    #[test]
    fn option_defaults_match_config() {
        assert_eq!(
            CoalesceOptions::default(),
            CoalesceConfig::default().local_options()
        );
        assert_eq!(
            DistributedOptions::default(),
            CoalesceConfig::default().distributed_options()
        );
    }
}
