//! Bounded embedding cache keyed by content hash and provider signature.
//!
//! Rows live in the tenant [`Store`]; this type adds the enable switch, the
//! provider partition and the size bound. A disabled cache reports every
//! lookup as a miss and never writes.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// `0` means unbounded.
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 0,
        }
    }
}

pub struct EmbeddingCache {
    settings: CacheSettings,
    provider_key: String,
}

impl EmbeddingCache {
    pub fn new(settings: CacheSettings, provider_key: impl Into<String>) -> Self {
        Self {
            settings,
            provider_key: provider_key.into(),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    pub fn provider_key(&self) -> &str {
        &self.provider_key
    }

    pub async fn get(&self, store: &dyn Store, hash: &str) -> Result<Option<Vec<f32>>> {
        let mut hits = self.get_many(store, &[hash.to_string()]).await?;
        Ok(hits.remove(hash))
    }

    pub async fn get_many(
        &self,
        store: &dyn Store,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        if !self.settings.enabled || hashes.is_empty() {
            return Ok(HashMap::new());
        }
        store.cache_get(&self.provider_key, hashes).await
    }

    pub async fn put(&self, store: &dyn Store, hash: &str, vector: &[f32]) -> Result<()> {
        self.put_many(store, &[(hash.to_string(), vector.to_vec())])
            .await
    }

    pub async fn put_many(&self, store: &dyn Store, entries: &[(String, Vec<f32>)]) -> Result<()> {
        if !self.settings.enabled || entries.is_empty() {
            return Ok(());
        }
        store.cache_put(&self.provider_key, entries).await
    }

    pub async fn len(&self, store: &dyn Store) -> Result<u64> {
        store.cache_count().await
    }

    /// Enforce `max_entries`. Returns the number of evicted rows.
    pub async fn prune(&self, store: &dyn Store) -> Result<u64> {
        if !self.settings.enabled || self.settings.max_entries == 0 {
            return Ok(0);
        }
        store.cache_prune(self.settings.max_entries).await
    }
}
