//! Shared Store seam.
//!
//! The cache and the distributed coalescer coordinate across processes
//! through a network key-value store. Only the handful of commands they need
//! are modelled here; every call is a single round trip and there are no
//! multi-key transactions.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors surfaced by a [`SharedStore`] implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store command `{command}` failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }
}

/// Options for [`SharedStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expiry, rounded up to whole seconds by network stores.
    pub expiry: Option<Duration>,
    /// Only write when the key is absent.
    pub only_if_absent: bool,
}

impl SetOptions {
    pub fn expire_in(expiry: Duration) -> Self {
        Self {
            expiry: Some(expiry),
            only_if_absent: false,
        }
    }

    pub fn absent_with_expiry(expiry: Duration) -> Self {
        Self {
            expiry: Some(expiry),
            only_if_absent: true,
        }
    }
}

/// Commands consumed from the shared key-value store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value` under `key`. Returns `false` when `only_if_absent` was
    /// requested and the key already existed.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool, StoreError>;

    /// Deletes the given keys and returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError>;

    /// Makes `key` live for at least `expiry` from now. A key without an
    /// expiry gets one; a later expiry is kept. Absent keys are ignored.
    async fn extend_expiry(&self, key: &str, expiry: Duration) -> Result<(), StoreError>;

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError>;
}

/// Whole seconds for a store expiry; never zero.
pub(crate) fn expiry_seconds(expiry: Duration) -> u64 {
    let secs = expiry.as_secs() + u64::from(expiry.subsec_nanos() > 0);
    secs.max(1)
}
