//! # Redis Shadow Store
//!
//! `ShadowStore` over a multiplexed async Redis connection. The
//! `ConnectionManager` reconnects on its own and is cheap to clone, so each
//! operation works on its own clone.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tracing::info;

use crate::error::StoreError;
use crate::store::ShadowStore;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Clone)]
pub struct RedisShadowStore {
    manager: ConnectionManager,
}

impl RedisShadowStore {
    /// Opens a managed connection to `url` (e.g. "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("connected to redis");
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ShadowStore for RedisShadowStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        match ttl {
            // SETEX rejects zero.
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                let _: () = conn.set_ex(key, value, secs).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }
}
