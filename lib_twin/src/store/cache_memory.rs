//! In-memory `ShadowStore` backed by a `DashMap`. Expired keys are treated as
//! absent and dropped lazily on access.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::ShadowStore;
use crate::error::StoreError;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
pub struct MemoryShadowStore {
    entries: DashMap<String, Entry>,
}

impl MemoryShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        // The read guard is released above; removing under it would deadlock.
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }
}

#[async_trait]
impl ShadowStore for MemoryShadowStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_value(key))
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_value(key).is_some())
    }
}
