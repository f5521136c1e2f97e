use std::sync::Arc;

use tracing::info;

use crate::config::{StoreBackend, StoreSettings};
use crate::store::{MemoryStore, SharedStore};

use super::error::InfraError;

/// Build the shared store selected by `settings`.
pub async fn connect(settings: &StoreSettings) -> Result<Arc<dyn SharedStore>, InfraError> {
    match settings.backend {
        StoreBackend::Memory => {
            info!(backend = "memory", "Using in-process shared store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => connect_redis(settings).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(settings: &StoreSettings) -> Result<Arc<dyn SharedStore>, InfraError> {
    let url = settings
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("store.url is required for redis"))?;
    Ok(Arc::new(crate::store::RedisStore::connect(url).await?))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_settings: &StoreSettings) -> Result<Arc<dyn SharedStore>, InfraError> {
    Err(InfraError::configuration(
        "the redis backend needs hearth built with the `redis` feature",
    ))
}
