//! Cache entry envelope and freshness rules.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::millis;

const STORE_EXPIRY_GRACE: Duration = Duration::from_secs(1);

/// Value stored in the shared store for every cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Write time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, timestamp: u64, tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            data,
            timestamp,
            tags: tags.into_iter().collect(),
        }
    }

    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

/// Per-call cache options. TTLs are whole seconds on the wire; ages are
/// compared in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub stale_while_revalidate: Duration,
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_while_revalidate: Duration::ZERO,
            tags: Vec::new(),
        }
    }

    pub fn ttl_secs(ttl: u64) -> Self {
        Self::new(Duration::from_secs(ttl))
    }

    pub fn stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = window;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// How long the shared store keeps the entry: fresh plus stale window,
    /// plus one second so the last stale millisecond is still readable.
    pub(crate) fn store_expiry(&self) -> Duration {
        self.ttl
            .saturating_add(self.stale_while_revalidate)
            .saturating_add(STORE_EXPIRY_GRACE)
    }

    pub(crate) fn freshness(&self, age_millis: u64) -> Freshness {
        let ttl = millis(self.ttl);
        if age_millis <= ttl {
            Freshness::Fresh
        } else if age_millis <= ttl.saturating_add(millis(self.stale_while_revalidate)) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::ttl_secs(3600)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Fresh(T),
    /// Past its TTL but inside the stale window. Served as-is; refreshing is
    /// the caller's job.
    Stale(T),
    Miss,
}

impl<T> CacheLookup<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            CacheLookup::Fresh(value) | CacheLookup::Stale(value) => Some(value),
            CacheLookup::Miss => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CacheLookup::Stale(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss)
    }
}
