//! Cache configuration.
//!
//! Default freshness settings for the tagged cache, overridable through the
//! `[cache]` table of `hearth.toml`.

use std::time::Duration;

use serde::Deserialize;

use super::entry::CacheOptions;

const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_STALE_WHILE_REVALIDATE_SECS: u64 = 0;
const DEFAULT_TAG_INDEX_PREFIX: &str = "cache:tag:";

/// Tagged cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window in seconds for calls that do not pass their own options.
    pub ttl_secs: u64,
    /// Stale window in seconds served after `ttl_secs` has elapsed.
    pub stale_while_revalidate_secs: u64,
    /// Prefix of the store key holding a tag's key set.
    pub tag_index_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            stale_while_revalidate_secs: DEFAULT_STALE_WHILE_REVALIDATE_SECS,
            tag_index_prefix: DEFAULT_TAG_INDEX_PREFIX.to_string(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl_secs: settings.ttl.as_secs(),
            stale_while_revalidate_secs: settings.stale_while_revalidate.as_secs(),
            tag_index_prefix: settings.tag_index_prefix.clone(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_while_revalidate(&self) -> Duration {
        Duration::from_secs(self.stale_while_revalidate_secs)
    }

    /// Options carrying the configured defaults and no tags.
    pub fn default_options(&self) -> CacheOptions {
        CacheOptions::new(self.ttl()).stale_while_revalidate(self.stale_while_revalidate())
    }

    pub(crate) fn tag_index_key(&self, tag: &str) -> String {
        format!("{}{tag}", self.tag_index_prefix)
    }
}
