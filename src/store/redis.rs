//! Redis-backed [`SharedStore`].

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{SetOptions, SharedStore, StoreError, expiry_seconds};

/// Shared Store over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let manager = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("Connected to redis shared store");
        Ok(Self { manager })
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::unavailable(err.to_string())
}

fn failed(command: &'static str) -> impl FnOnce(redis::RedisError) -> StoreError {
    move |err| {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::unavailable(err.to_string())
        } else {
            StoreError::command(command, err.to_string())
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(failed("GET"))
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if options.only_if_absent {
            cmd.arg("NX");
        }
        if let Some(expiry) = options.expiry {
            cmd.arg("EX").arg(expiry_seconds(expiry));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(failed("SET"))?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        conn.del(keys).await.map_err(failed("DEL"))
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _added: u64 = conn.sadd(set, member).await.map_err(failed("SADD"))?;
        Ok(())
    }

    async fn extend_expiry(&self, key: &str, expiry: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let secs = expiry_seconds(expiry);
        // NX covers keys without a TTL, GT keeps the later of two TTLs (Redis 7+).
        let (): () = redis::pipe()
            .atomic()
            .cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .arg("NX")
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .arg("GT")
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(failed("EXPIRE"))?;
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.smembers(set).await.map_err(failed("SMEMBERS"))
    }
}
