//! Tagged cache.
//!
//! Read-through style cache over the [`SharedStore`](crate::store::SharedStore):
//!
//! - **TTL + stale window**: entries are fresh for `ttl`, then served as stale
//!   for `stale_while_revalidate`, then treated as absent
//! - **Tag index**: every tag keeps the set of keys written with it, so a
//!   whole family of entries can be dropped with one call
//! - **Fail-open**: store trouble turns into misses and error events, never
//!   into caller-visible failures
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_secs = 3600
//! stale_while_revalidate_secs = 0
//! tag_index_prefix = "cache:tag:"
//! ```

mod config;
mod entry;
mod keys;
mod tagged;

pub use config::CacheConfig;
pub use entry::{CacheEntry, CacheLookup, CacheOptions};
pub use keys::generate_cache_key;
pub use tagged::{InvalidationReport, TaggedCache};
