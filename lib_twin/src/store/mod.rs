//! # Storage Capabilities
//!
//! The twin core reads and writes shadows and metadata through `ShadowStore`
//! (a TTL-capable string key-value store) and records device metadata through
//! `DeviceRepository`. Concrete backends live in `connections` (Redis,
//! PostgreSQL); `MemoryShadowStore` is always available.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::DeviceMeta;

/// Typed document access and key layout.
pub mod gateway;
/// Process-local store, used for tests and storeless runs.
pub mod cache_memory;

pub use cache_memory::MemoryShadowStore;
pub use gateway::ShadowGateway;

/// Raw key-value operations the gateway is built on.
#[async_trait]
pub trait ShadowStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Durable bookkeeping of device metadata.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Inserts or updates the row keyed by `meta.device_id`.
    async fn upsert_device(&self, meta: &DeviceMeta) -> Result<(), StoreError>;
}

/// Repository used when relational persistence is disabled.
pub struct NullDeviceRepository;

#[async_trait]
impl DeviceRepository for NullDeviceRepository {
    async fn upsert_device(&self, _meta: &DeviceMeta) -> Result<(), StoreError> {
        Ok(())
    }
}
