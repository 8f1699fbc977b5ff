//! Where a tenant's index and content live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use bridge_memory_core::content::memory::InMemoryContentStore;
use bridge_memory_core::content::ContentStore;
use bridge_memory_core::models::TenantScope;
use bridge_memory_core::store::memory::InMemoryStore;
use bridge_memory_core::store::{Availability, Store};

use crate::config::DbConfig;
use crate::sqlite_store::SqliteStore;
use crate::textfs::SqliteContentStore;
use crate::{db, migrate};

/// The two stores a manager works against.
#[derive(Clone)]
pub struct TenantStores {
    pub store: Arc<dyn Store>,
    pub content: Arc<dyn ContentStore>,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn open(&self, scope: &TenantScope) -> Result<TenantStores>;
}

/// One SQLite database shared by every tenant; rows are partitioned by
/// the scope key.
pub struct SqliteBackend {
    pool: SqlitePool,
    fts: Availability,
}

impl SqliteBackend {
    /// Connect and run migrations.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let pool = db::connect(config).await?;
        let report = migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            fts: report.fts,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl IndexBackend for SqliteBackend {
    async fn open(&self, scope: &TenantScope) -> Result<TenantStores> {
        let store = SqliteStore::open(self.pool.clone(), scope, self.fts.clone()).await?;
        Ok(TenantStores {
            store: Arc::new(store),
            content: Arc::new(SqliteContentStore::new(self.pool.clone(), scope)),
        })
    }
}

/// Process-local stores, kept per tenant for the backend's lifetime.
#[derive(Default)]
pub struct InMemoryBackend {
    tenants: Mutex<HashMap<TenantScope, TenantStores>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    async fn open(&self, scope: &TenantScope) -> Result<TenantStores> {
        let mut tenants = self
            .tenants
            .lock()
            .map_err(|_| anyhow!("in-memory backend lock poisoned"))?;
        let stores = tenants.entry(scope.clone()).or_insert_with(|| TenantStores {
            store: Arc::new(InMemoryStore::new()),
            content: Arc::new(InMemoryContentStore::new()),
        });
        Ok(stores.clone())
    }
}
