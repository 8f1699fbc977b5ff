//! Process-wide cache of memory managers.
//!
//! The registry hands out one [`MemoryManager`] per tenant scope. A manager
//! is rebuilt when the tenant's `[memory]` configuration changes, detected
//! by comparing the fingerprint of the raw section. Resolved configs are
//! memoized by the same fingerprint so repeated lookups skip validation;
//! entries no live manager uses are dropped on rebuild, evict and close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::info;

use bridge_memory_core::models::TenantScope;

use crate::backend::IndexBackend;
use crate::config::{MemoryConfig, ResolvedConfig};
use crate::embedding::ProviderFactory;
use crate::manager::MemoryManager;

pub struct ManagerRegistry {
    backend: Arc<dyn IndexBackend>,
    providers: Arc<dyn ProviderFactory>,
    managers: tokio::sync::Mutex<HashMap<TenantScope, Arc<MemoryManager>>>,
    resolved: Mutex<HashMap<String, Arc<ResolvedConfig>>>,
}

impl ManagerRegistry {
    pub fn new(backend: Arc<dyn IndexBackend>, providers: Arc<dyn ProviderFactory>) -> Self {
        Self {
            backend,
            providers,
            managers: tokio::sync::Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Validate `config`, reusing an earlier result with the same fingerprint.
    pub fn resolve(&self, config: &MemoryConfig) -> Result<Arc<ResolvedConfig>> {
        let fingerprint = config.fingerprint()?;
        let mut resolved = self
            .resolved
            .lock()
            .map_err(|_| anyhow!("resolved config cache poisoned"))?;
        if let Some(hit) = resolved.get(&fingerprint) {
            return Ok(Arc::clone(hit));
        }
        let fresh = Arc::new(config.resolve()?);
        resolved.insert(fingerprint, Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Manager for `scope`, created on first use.
    ///
    /// Concurrent callers for the same scope share one instance. When the
    /// configuration changed since the manager was built, the old one is
    /// closed and replaced.
    pub async fn get(&self, scope: &TenantScope, config: &MemoryConfig) -> Result<Arc<MemoryManager>> {
        let resolved = self.resolve(config)?;
        let mut managers = self.managers.lock().await;

        if let Some(existing) = managers.get(scope) {
            if existing.fingerprint() == resolved.fingerprint {
                return Ok(Arc::clone(existing));
            }
            info!(tenant = %scope, "Memory config changed, rebuilding manager");
            if let Some(stale) = managers.remove(scope) {
                stale.close().await;
            }
        }

        let stores = self.backend.open(scope).await?;
        let manager = Arc::new(MemoryManager::new(
            scope.clone(),
            resolved,
            stores,
            self.providers.as_ref(),
        )?);
        managers.insert(scope.clone(), Arc::clone(&manager));
        self.retain_live(&managers);
        Ok(manager)
    }

    fn retain_live(&self, managers: &HashMap<TenantScope, Arc<MemoryManager>>) {
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.retain(|fingerprint, _| managers.values().any(|m| m.fingerprint() == fingerprint));
        }
    }

    /// Number of memoized resolved configs.
    pub fn resolved_len(&self) -> usize {
        self.resolved.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Drop and close the manager for `scope`, if any.
    pub async fn evict(&self, scope: &TenantScope) -> bool {
        let removed = {
            let mut managers = self.managers.lock().await;
            let removed = managers.remove(scope);
            self.retain_live(&managers);
            removed
        };
        match removed {
            Some(manager) => {
                manager.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.managers.lock().await.drain().map(|(_, m)| m).collect();
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.clear();
        }
        for manager in drained {
            manager.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.managers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
