//! Per-tenant memory manager.
//!
//! A [`MemoryManager`] owns one tenant's stores, its embedding provider and
//! cache, and a scheduler task. The task receives change notifications over
//! an unbounded channel and turns them into sync passes:
//!
//! | Trigger | Effect |
//! |---------|--------|
//! | file changed / session delta reached | push the debounce deadline, sync when it expires |
//! | session start | sync now |
//! | interval tick | sync, then prune expired sessions |
//!
//! Sync passes are serialized by an async mutex. Mutable bookkeeping sits
//! behind a `std::sync::Mutex` that is never held across an `.await`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use bridge_memory_core::cache::EmbeddingCache;
use bridge_memory_core::content::{ContentMeta, ContentStore};
use bridge_memory_core::models::{SessionRecord, Source, TenantScope};
use bridge_memory_core::paths::{normalize_path, session_path, PathRules};
use bridge_memory_core::search::{
    self, SearchMode, SearchOutcome, SearchParams, SearchRequest, MAX_RESULTS,
};
use bridge_memory_core::store::{Availability, Store};

use crate::backend::TenantStores;
use crate::config::ResolvedConfig;
use crate::embedding::batch::BatchTelemetry;
use crate::embedding::{select_provider, Embedder, ProviderFactory, ProviderStatus};
use crate::read::{read_file, ReadFileResult};
use crate::status::{CacheStatus, FtsStatus, MemoryStatus, VectorStatus};
use crate::sync::{
    prune_sessions, run_sync, session_key_for_path, PruneReport, SyncContext, SyncOptions,
    SyncReason, SyncReport,
};

/// Per-call overrides for [`MemoryManager::search`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    /// Upper bound on the sync-on-search pass.
    pub deadline: Option<Duration>,
}

enum Trigger {
    Changed,
    SessionStart,
    Shutdown,
}

struct ManagerState {
    dirty: bool,
    /// Bumped on every change; a pass only clears `dirty` if no change
    /// arrived while it ran.
    epoch: u64,
    warmed: HashSet<String>,
    last_sync: Option<SyncReport>,
    last_sync_error: Option<String>,
    last_lexical_error: Option<String>,
    last_vector_error: Option<String>,
}

struct ManagerInner {
    scope: TenantScope,
    config: Arc<ResolvedConfig>,
    rules: PathRules,
    store: Arc<dyn Store>,
    content: Arc<dyn ContentStore>,
    embedder: Option<Arc<Embedder>>,
    provider_status: ProviderStatus,
    cache: EmbeddingCache,
    state: Mutex<ManagerState>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl ManagerInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory manager state poisoned"))
    }

    fn mark_dirty(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        state.dirty = true;
        state.epoch += 1;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.state.lock().map(|s| s.dirty).unwrap_or(true)
    }

    async fn sync(&self, opts: SyncOptions) -> Result<Option<SyncReport>> {
        let _guard = self.sync_lock.lock().await;

        let epoch = {
            let state = self.lock_state()?;
            if opts.reason.is_lazy() && !state.dirty {
                return Ok(None);
            }
            state.epoch
        };

        let ctx = SyncContext {
            config: &self.config,
            rules: &self.rules,
            store: self.store.as_ref(),
            content: self.content.as_ref(),
            embedder: self.embedder.as_deref(),
            cache: &self.cache,
        };
        let result = run_sync(&ctx, opts).await;

        let mut state = self.lock_state()?;
        match result {
            Ok(report) => {
                if report.succeeded() && state.epoch == epoch {
                    state.dirty = false;
                }
                state.last_sync_error = report
                    .failed
                    .first()
                    .map(|f| format!("{}: {}", f.path, f.error));
                state.last_sync = Some(report.clone());
                Ok(Some(report))
            }
            Err(e) => {
                state.last_sync_error = Some(format!("{:#}", e));
                Err(e)
            }
        }
    }

    async fn sync_logged(&self, reason: SyncReason) {
        if let Err(e) = self.sync(SyncOptions::new(reason)).await {
            warn!(tenant = %self.scope, reason = ?reason, error = %format!("{:#}", e), "Memory sync failed");
        }
    }

    /// Prune expired transcripts. Anything removed leaves the tenant dirty
    /// so the next pass re-checks those paths against the content store.
    async fn prune(&self, now: i64) -> Result<PruneReport> {
        let report = prune_sessions(self.store.as_ref(), self.config.sync.retention_days, now).await?;
        if report.sessions_removed > 0 {
            self.mark_dirty()?;
        }
        Ok(report)
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_scheduler(inner: Arc<ManagerInner>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
    let debounce = inner.config.sync.debounce();
    let mut interval = inner.config.sync.interval().map(|period| {
        let mut i = tokio::time::interval_at(Instant::now() + period, period);
        i.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        i
    });
    let mut pending: Option<Instant> = None;

    loop {
        let deadline = pending;
        let debounce_expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            msg = triggers.recv() => match msg {
                Some(Trigger::Changed) => {
                    pending = Some(Instant::now() + debounce);
                }
                Some(Trigger::SessionStart) => {
                    inner.sync_logged(SyncReason::SessionStart).await;
                }
                Some(Trigger::Shutdown) | None => break,
            },
            _ = debounce_expired => {
                pending = None;
                debug!(tenant = %inner.scope, "Debounce expired");
                inner.sync_logged(SyncReason::Watch).await;
            }
            _ = next_tick(&mut interval) => {
                inner.sync_logged(SyncReason::Interval).await;
                if let Err(e) = inner.prune(chrono::Utc::now().timestamp()).await {
                    warn!(tenant = %inner.scope, error = %e, "Session prune failed");
                }
            }
        }
    }
    debug!(tenant = %inner.scope, "Memory scheduler stopped");
}

/// Memory engine for one tenant.
pub struct MemoryManager {
    inner: Arc<ManagerInner>,
    triggers: mpsc::UnboundedSender<Trigger>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryManager {
    /// Build a manager and start its scheduler task.
    ///
    /// Must be called inside a tokio runtime. The index starts dirty, so
    /// the first search or session start syncs.
    pub fn new(
        scope: TenantScope,
        config: Arc<ResolvedConfig>,
        stores: TenantStores,
        providers: &dyn ProviderFactory,
    ) -> Result<Self> {
        let rules = config.path_rules()?;
        let selection = select_provider(providers, &config);
        let provider_key = selection
            .embedder
            .as_ref()
            .map(|e| e.provider_key())
            .unwrap_or_default();

        let inner = Arc::new(ManagerInner {
            cache: EmbeddingCache::new(config.cache, provider_key),
            scope,
            rules,
            store: stores.store,
            content: stores.content,
            embedder: selection.embedder,
            provider_status: selection.status,
            state: Mutex::new(ManagerState {
                dirty: true,
                epoch: 0,
                warmed: HashSet::new(),
                last_sync: None,
                last_sync_error: None,
                last_lexical_error: None,
                last_vector_error: None,
            }),
            sync_lock: tokio::sync::Mutex::new(()),
            config,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_scheduler(Arc::clone(&inner), rx));

        Ok(Self {
            inner,
            triggers: tx,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    pub fn scope(&self) -> &TenantScope {
        &self.inner.scope
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    pub fn fingerprint(&self) -> &str {
        &self.inner.config.fingerprint
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    pub fn provider_status(&self) -> &ProviderStatus {
        &self.inner.provider_status
    }

    fn send(&self, trigger: Trigger) {
        // A closed scheduler only loses background work.
        let _ = self.triggers.send(trigger);
    }

    /// Run a sync pass now. Lazy reasons return `None` when clean.
    pub async fn sync(&self, opts: SyncOptions) -> Result<Option<SyncReport>> {
        self.inner.sync(opts).await
    }

    /// Hybrid search, syncing first when dirty and `on_search` is set.
    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<SearchOutcome> {
        let inner = &self.inner;
        let config = &inner.config;

        if query.trim().is_empty() {
            return Ok(SearchOutcome {
                mode: SearchMode::Hybrid,
                ..SearchOutcome::default()
            });
        }

        if config.sync.on_search && inner.is_dirty() {
            let pass = inner.sync(SyncOptions::new(SyncReason::Search));
            let outcome = match opts.deadline {
                Some(limit) => tokio::time::timeout(limit, pass)
                    .await
                    .map_err(|_| anyhow!("sync-on-search exceeded {:?}", limit)),
                None => Ok(pass.await),
            };
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) | Err(e) => {
                    warn!(tenant = %inner.scope, error = %format!("{:#}", e), "Searching last committed index");
                }
            }
        }

        let params = SearchParams {
            max_results: opts
                .max_results
                .unwrap_or(config.search.max_results)
                .clamp(1, MAX_RESULTS),
            min_score: opts
                .min_score
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 1.0))
                .unwrap_or(config.search.min_score),
            ..config.search.clone()
        };

        let vector_engine = inner.store.engines().vector;
        let (query_vec, vector_unavailable) = if !config.vector_enabled {
            (None, Some("vector search disabled".to_string()))
        } else if let Some(reason) = vector_engine.error() {
            (None, Some(reason.to_string()))
        } else {
            match &inner.embedder {
                None => (
                    None,
                    Some(
                        inner
                            .provider_status
                            .error
                            .clone()
                            .unwrap_or_else(|| "no embedding provider".to_string()),
                    ),
                ),
                Some(embedder) => {
                    match embedder
                        .embed_query(inner.store.as_ref(), &inner.cache, query)
                        .await
                    {
                        Ok(vec) => (Some(vec), None),
                        Err(e) => (None, Some(format!("query embedding failed: {:#}", e))),
                    }
                }
            }
        };

        let outcome = search::search(
            inner.store.as_ref(),
            &SearchRequest {
                query,
                query_vec: query_vec.as_deref(),
                vector_unavailable: vector_unavailable.as_deref(),
                params: &params,
            },
        )
        .await;

        if let Some(notice) = &outcome.notice {
            warn!(tenant = %inner.scope, "{}", notice);
        }
        let mut state = inner.lock_state()?;
        if outcome.lexical_error.is_some() {
            state.last_lexical_error = outcome.lexical_error.clone();
        }
        if config.vector_enabled && inner.embedder.is_some() {
            state.last_vector_error = outcome.vector_error.clone();
        }
        Ok(outcome)
    }

    /// Record that a document changed outside the manager. Paths that are
    /// not indexable are ignored.
    pub fn notify_file_changed(&self, path: &str) -> Result<bool> {
        let Ok(normalized) = normalize_path(path) else {
            return Ok(false);
        };
        if self.inner.rules.classify(&normalized).is_none() {
            return Ok(false);
        }
        self.inner.mark_dirty()?;
        if self.inner.config.sync.watch {
            self.send(Trigger::Changed);
        }
        Ok(true)
    }

    /// Accumulate transcript growth for `session_key`. Marks the tenant
    /// dirty once either delta threshold is reached.
    pub async fn notify_session_delta(
        &self,
        session_key: &str,
        bytes: u64,
        messages: u64,
    ) -> Result<bool> {
        let config = &self.inner.config;
        if !config.sessions_enabled() {
            return Ok(false);
        }
        let path = session_path(session_key);
        let key = session_key_for_path(&path).unwrap_or(session_key).to_string();
        let now = chrono::Utc::now().timestamp();

        let mut record = self
            .inner
            .store
            .get_session_record(&key)
            .await?
            .unwrap_or_else(|| SessionRecord::new(&key, &path, now));
        record.pending_bytes += bytes;
        record.pending_messages += messages;
        record.updated_at = now;
        self.inner.store.upsert_session_record(&record).await?;

        let due = record.indexed_at.is_none()
            || record.delta_reached(config.sync.delta_bytes, config.sync.delta_messages);
        if due {
            self.inner.mark_dirty()?;
            if config.sync.watch {
                self.send(Trigger::Changed);
            }
        }
        Ok(due)
    }

    /// Trigger the session-start sync once per session key.
    pub fn warm_session(&self, session_key: &str) -> Result<bool> {
        if !self.inner.config.sync.on_session_start {
            return Ok(false);
        }
        let first = self
            .inner
            .lock_state()?
            .warmed
            .insert(session_key.to_string());
        if first {
            self.send(Trigger::SessionStart);
        }
        Ok(first)
    }

    /// Create or overwrite a memory note (or any indexable path).
    pub async fn write_file(&self, path: &str, text: &str, append: bool) -> Result<ContentMeta> {
        let (path, _source) = self.inner.rules.resolve(path)?;
        let meta = if append {
            self.inner.content.append(&path, text).await?
        } else {
            self.inner.content.write(&path, text).await?
        };
        self.notify_file_changed(&path)?;
        Ok(meta)
    }

    /// Append to a session transcript and account for the delta.
    pub async fn append_session(&self, session_key: &str, text: &str) -> Result<ContentMeta> {
        let path = session_path(session_key);
        if self.inner.rules.classify(&path) != Some(Source::Sessions) {
            return Err(bridge_memory_core::error::PathError::NotIndexable(path).into());
        }
        let meta = self.inner.content.append(&path, text).await?;
        self.notify_session_delta(session_key, text.len() as u64, 1)
            .await?;
        Ok(meta)
    }

    pub async fn prune_sessions(&self) -> Result<PruneReport> {
        self.prune_sessions_at(chrono::Utc::now().timestamp()).await
    }

    /// Prune as of `now` (unix seconds).
    pub async fn prune_sessions_at(&self, now: i64) -> Result<PruneReport> {
        self.inner.prune(now).await
    }

    pub async fn read_file(
        &self,
        path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> Result<ReadFileResult> {
        read_file(
            self.inner.content.as_ref(),
            &self.inner.rules,
            path,
            from,
            lines,
        )
        .await
    }

    /// Whether vector search could run right now.
    pub fn probe_vector_availability(&self) -> Availability {
        let inner = &self.inner;
        if !inner.config.vector_enabled {
            return Availability::Unavailable("vector search disabled".into());
        }
        if let Availability::Unavailable(reason) = inner.store.engines().vector {
            return Availability::Unavailable(reason);
        }
        match (&inner.embedder, &inner.provider_status.error) {
            (Some(_), _) => Availability::Ready,
            (None, Some(err)) => Availability::Unavailable(err.clone()),
            (None, None) => Availability::Unavailable("no embedding provider".into()),
        }
    }

    /// Embed a probe string through the provider, bypassing the cache.
    pub async fn probe_embedding_availability(&self) -> Availability {
        let Some(embedder) = &self.inner.embedder else {
            return Availability::Unavailable(
                self.inner
                    .provider_status
                    .error
                    .clone()
                    .unwrap_or_else(|| "no embedding provider".into()),
            );
        };
        match embedder.embed_texts(&["ping".to_string()]).await {
            Ok(v) if v.first().is_some_and(|x| !x.is_empty()) => Availability::Ready,
            Ok(_) => Availability::Unavailable("provider returned an empty vector".into()),
            Err(e) => Availability::Unavailable(e.to_string()),
        }
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        let inner = &self.inner;
        let config = &inner.config;
        let counts = inner.store.counts().await?;
        let entries = inner.cache.len(inner.store.as_ref()).await?;
        let sessions_tracked = inner.store.list_session_records().await?.len();
        let meta = inner.store.read_meta().await?;
        let engines = inner.store.engines();

        let state = inner.lock_state()?;
        let batch = inner
            .embedder
            .as_ref()
            .and_then(|e| e.batch_telemetry())
            .unwrap_or_else(|| BatchTelemetry {
                enabled: config.batch.enabled,
                wait: config.batch.wait,
                concurrency: config.batch.concurrency,
                poll_interval_ms: config.batch.poll_interval_ms,
                timeout_minutes: config.batch.timeout_minutes,
                limit: crate::embedding::batch::BATCH_FAILURE_LIMIT,
                ..BatchTelemetry::default()
            });

        Ok(MemoryStatus {
            tenant: inner.scope.key(),
            dirty: state.dirty,
            sources: config.sources.iter().map(|s| s.as_str().to_string()).collect(),
            extra_paths: config.extra_paths.clone(),
            files: counts.iter().map(|c| c.files).sum(),
            chunks: counts.iter().map(|c| c.chunks).sum(),
            counts,
            sessions_tracked,
            provider: inner.provider_status.clone(),
            cache: CacheStatus {
                enabled: config.cache.enabled,
                entries,
                max_entries: config.cache.max_entries,
            },
            fts: FtsStatus {
                enabled: true,
                available: engines.lexical.is_ready(),
                error: engines
                    .lexical
                    .error()
                    .map(str::to_string)
                    .or_else(|| state.last_lexical_error.clone()),
            },
            vector: VectorStatus {
                enabled: config.vector_enabled,
                available: engines.vector.is_ready() && inner.embedder.is_some(),
                dims: meta
                    .and_then(|m| m.vector_dims)
                    .or_else(|| inner.embedder.as_ref().and_then(|e| e.dims())),
                error: engines
                    .vector
                    .error()
                    .map(str::to_string)
                    .or_else(|| state.last_vector_error.clone())
                    .or_else(|| inner.provider_status.error.clone()),
            },
            batch,
            last_sync: state.last_sync.clone(),
            last_sync_error: state.last_sync_error.clone(),
        })
    }

    /// Stop the scheduler and wait for it to exit.
    pub async fn close(&self) {
        self.send(Trigger::Shutdown);
        let handle = self.scheduler.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(tenant = %self.inner.scope, error = %e, "Memory scheduler ended abnormally");
            }
        }
        info!(tenant = %self.inner.scope, "Memory manager closed");
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.send(Trigger::Shutdown);
    }
}
