//! # Shadow Gateway
//!
//! JSON documents on top of a raw `ShadowStore`, plus the key layout:
//! `meta:{id}`, `shadow:{id}` and `fleet:index`, each under an optional prefix.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ShadowStore;
use crate::error::StoreError;
use crate::model::{DeviceMeta, Shadow};

pub const FLEET_INDEX_KEY: &str = "fleet:index";

#[derive(Clone)]
pub struct ShadowGateway {
    store: Arc<dyn ShadowStore>,
    prefix: String,
}

impl ShadowGateway {
    pub fn new(store: Arc<dyn ShadowStore>) -> Self {
        Self::with_prefix(store, "")
    }

    pub fn with_prefix(store: Arc<dyn ShadowStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn meta_key(&self, device_id: &str) -> String {
        format!("{}meta:{}", self.prefix, device_id)
    }

    pub fn shadow_key(&self, device_id: &str) -> String {
        format!("{}shadow:{}", self.prefix, device_id)
    }

    pub fn fleet_index_key(&self) -> String {
        format!("{}{}", self.prefix, FLEET_INDEX_KEY)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get_raw(key).await? {
            Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.store.set_raw(key, raw, ttl).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.store.exists(key).await
    }

    pub async fn get_meta(&self, device_id: &str) -> Result<Option<DeviceMeta>, StoreError> {
        self.get(&self.meta_key(device_id)).await
    }

    pub async fn set_meta(&self, meta: &DeviceMeta) -> Result<(), StoreError> {
        self.set(&self.meta_key(&meta.device_id), meta, None).await
    }

    pub async fn get_shadow(&self, device_id: &str) -> Result<Option<Shadow>, StoreError> {
        self.get(&self.shadow_key(device_id)).await
    }

    pub async fn set_shadow(&self, shadow: &Shadow) -> Result<(), StoreError> {
        self.set(&self.shadow_key(&shadow.device_id), shadow, None).await
    }

    pub async fn shadow_exists(&self, device_id: &str) -> Result<bool, StoreError> {
        self.exists(&self.shadow_key(device_id)).await
    }

    /// The fleet index, empty when it was never written.
    pub async fn fleet_index(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .get::<Vec<String>>(&self.fleet_index_key())
            .await?
            .unwrap_or_default())
    }

    /// Replaces the whole index in one write.
    pub async fn set_fleet_index(&self, device_ids: &[String]) -> Result<(), StoreError> {
        self.set(&self.fleet_index_key(), device_ids, None).await
    }
}
