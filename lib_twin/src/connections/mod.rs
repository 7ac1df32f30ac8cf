//! # Connections Module
//!
//! Backends for the storage capabilities: Redis for shadows and metadata,
//! PostgreSQL for the durable device table.

/// PostgreSQL connection pooling and the `printers` repository.
pub mod db_postgres;

/// Redis implementation of `ShadowStore`.
pub mod cache_redis;

pub use cache_redis::RedisShadowStore;
pub use db_postgres::{Database, DbError, PgDeviceRepository};
