//! # PostgreSQL Device Repository
//!
//! A `deadpool_postgres` pool and the `printers` table, one row per device,
//! upserted on every fleet refresh.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::info;

use crate::error::StoreError;
use crate::model::DeviceMeta;
use crate::store::DeviceRepository;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to create connection pool: {0}")]
    ConnectionError(String),
    #[error("Query execution failed: {0}")]
    QueryError(String),
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DbError::ConnectionError(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        DbError::QueryError(e.to_string())
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

const CREATE_PRINTERS: &str = "CREATE TABLE IF NOT EXISTS printers (
    dev_id    TEXT PRIMARY KEY,
    name      TEXT,
    model     TEXT,
    product   TEXT,
    online    BOOLEAN NOT NULL DEFAULT FALSE,
    last_seen TIMESTAMPTZ NOT NULL
)";

const UPSERT_PRINTER: &str = "INSERT INTO printers (dev_id, name, model, product, online, last_seen)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (dev_id) DO UPDATE SET
    name = EXCLUDED.name,
    model = EXCLUDED.model,
    product = EXCLUDED.product,
    online = EXCLUDED.online,
    last_seen = EXCLUDED.last_seen";

/// A wrapper around the PostgreSQL connection pool.
#[derive(Clone)]
pub struct Database {
    pub pool: Pool,
}

impl Database {
    /// Builds the pool. Connections are opened lazily on first use.
    pub fn new(database_url: &str, max_connections: usize) -> Result<Self, DbError> {
        let mut cfg = DeadpoolConfig::new();
        cfg.url = Some(database_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_connections.max(1)));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

pub struct PgDeviceRepository {
    db: Database,
}

impl PgDeviceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        let client = self.db.pool.get().await?;
        client.batch_execute(CREATE_PRINTERS).await?;
        info!("printers table ready");
        Ok(())
    }
}

#[async_trait]
impl DeviceRepository for PgDeviceRepository {
    async fn upsert_device(&self, meta: &DeviceMeta) -> Result<(), StoreError> {
        let client = self.db.pool.get().await.map_err(DbError::from)?;
        client
            .execute(
                UPSERT_PRINTER,
                &[
                    &meta.device_id,
                    &meta.name,
                    &meta.model,
                    &meta.product,
                    &meta.online,
                    &Utc::now(),
                ],
            )
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}
