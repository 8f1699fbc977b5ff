//! Embedding backends, retry, and provider selection.
//!
//! # Backends
//!
//! | Variant | Module | Transport |
//! |---------|--------|-----------|
//! | [`EmbeddingBackend::Local`] | `local` | fastembed on the blocking pool (feature `local-embeddings`) |
//! | [`EmbeddingBackend::Remote`] | [`remote`] | one HTTP call per batch (OpenAI, Ollama) |
//! | [`EmbeddingBackend::RemoteBatch`] | [`batch`] | submit, poll, download (OpenAI Batch API) |
//! | [`EmbeddingBackend::Custom`] | | any [`EmbeddingProvider`] supplied by the host |
//!
//! # Retry
//!
//! [`embed_batch_with_retry`] retries transient failures and timeouts with
//! exponential backoff (`base · 2^(attempt−1)`, exponent capped at 5).
//! Rejections fail immediately.
//!
//! # Selection
//!
//! [`select_provider`] builds the configured provider once. When it fails
//! to initialize and a fallback is configured, the fallback is built
//! instead and the reason is kept in [`ProviderStatus`]. There is no
//! per-call fallback.

pub mod batch;
#[cfg(feature = "local-embeddings")]
pub mod local;
pub mod remote;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use bridge_memory_core::cache::EmbeddingCache;
use bridge_memory_core::chunk::hash_text;
use bridge_memory_core::embedding::{normalize_embedding, EmbeddingProvider};
use bridge_memory_core::error::EmbeddingError;
use bridge_memory_core::store::Store;

use crate::config::{ProviderKind, ResolvedConfig};
use batch::{BatchProvider, BatchTelemetry, OpenAiBatchTransport};
use remote::RemoteProvider;

/// Backoff schedule for [`embed_batch_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.min(crate::config::MAX_EMBED_RETRIES),
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Call `provider` until it succeeds, fails permanently, or retries run out.
pub async fn embed_batch_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tokio::time::sleep(policy.delay(attempt)).await;
        }

        match provider.embed_batch(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_retryable() => {
                debug!(attempt, error = %e, "Embedding attempt failed");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| EmbeddingError::Transient("embedding failed after retries".into())))
}

pub enum EmbeddingBackend {
    #[cfg(feature = "local-embeddings")]
    Local(local::LocalProvider),
    Remote(RemoteProvider),
    RemoteBatch(BatchProvider),
    Custom(Arc<dyn EmbeddingProvider>),
}

impl EmbeddingBackend {
    fn provider(&self) -> &dyn EmbeddingProvider {
        match self {
            #[cfg(feature = "local-embeddings")]
            EmbeddingBackend::Local(p) => p,
            EmbeddingBackend::Remote(p) => p,
            EmbeddingBackend::RemoteBatch(p) => p,
            EmbeddingBackend::Custom(p) => p.as_ref(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingBackend {
    fn id(&self) -> &str {
        self.provider().id()
    }

    fn model(&self) -> &str {
        self.provider().model()
    }

    fn dims(&self) -> Option<usize> {
        self.provider().dims()
    }

    fn provider_key(&self) -> String {
        self.provider().provider_key()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.provider().embed_batch(texts).await
    }
}

/// Vectors for a set of `(hash, text)` inputs and how many came from cache.
#[derive(Debug, Clone, Default)]
pub struct CachedEmbeddings {
    pub vectors: Vec<Vec<f32>>,
    pub hits: usize,
    pub misses: usize,
}

/// A backend plus the batching and retry rules applied to it.
///
/// Every vector leaving an `Embedder` is sanitized and L2-normalized.
pub struct Embedder {
    backend: EmbeddingBackend,
    policy: RetryPolicy,
    batch_size: usize,
}

impl Embedder {
    pub fn new(backend: EmbeddingBackend, policy: RetryPolicy, batch_size: usize) -> Self {
        Self {
            backend,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    pub fn id(&self) -> &str {
        self.backend.id()
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn dims(&self) -> Option<usize> {
        self.backend.dims()
    }

    pub fn provider_key(&self) -> String {
        self.backend.provider_key()
    }

    pub fn batch_telemetry(&self) -> Option<BatchTelemetry> {
        match &self.backend {
            EmbeddingBackend::RemoteBatch(p) => Some(p.telemetry()),
            _ => None,
        }
    }

    /// Embed `texts` in batches of `batch_size`, in input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = embed_batch_with_retry(&self.backend, batch, &self.policy).await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            out.extend(vectors.into_iter().map(normalize_embedding));
        }
        Ok(out)
    }

    /// Embed `(hash, text)` items, serving hits from `cache` and writing
    /// misses back. Cache read/write failures degrade to provider calls.
    pub async fn embed_cached(
        &self,
        store: &dyn Store,
        cache: &EmbeddingCache,
        items: &[(String, String)],
    ) -> Result<CachedEmbeddings> {
        let hashes: Vec<String> = items.iter().map(|(h, _)| h.clone()).collect();
        let mut known = match cache.get_many(store, &hashes).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Embedding cache lookup failed");
                HashMap::new()
            }
        };
        let hits = items.iter().filter(|(h, _)| known.contains_key(h)).count();

        let mut seen = HashSet::new();
        let (miss_hashes, miss_texts): (Vec<String>, Vec<String>) = items
            .iter()
            .filter(|(h, _)| !known.contains_key(h) && seen.insert(h.clone()))
            .cloned()
            .unzip();

        if !miss_texts.is_empty() {
            let vectors = self.embed_texts(&miss_texts).await?;
            let entries: Vec<(String, Vec<f32>)> = miss_hashes.into_iter().zip(vectors).collect();
            if let Err(e) = cache.put_many(store, &entries).await {
                warn!(error = %e, "Embedding cache write failed");
            }
            known.extend(entries);
        }

        let vectors = items
            .iter()
            .map(|(h, _)| {
                known
                    .get(h)
                    .cloned()
                    .ok_or_else(|| anyhow!("no vector produced for chunk {}", h))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(hits, misses = items.len() - hits, "Embedded through cache");
        Ok(CachedEmbeddings {
            vectors,
            hits,
            misses: items.len() - hits,
        })
    }

    /// Embed a search query through the cache.
    pub async fn embed_query(
        &self,
        store: &dyn Store,
        cache: &EmbeddingCache,
        query: &str,
    ) -> Result<Vec<f32>> {
        let item = (hash_text(query), query.to_string());
        let mut embedded = self.embed_cached(store, cache, &[item]).await?;
        embedded
            .vectors
            .pop()
            .ok_or_else(|| anyhow!("Query embedding returned no vector"))
    }
}

/// Which provider is in use and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub requested: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub fallback: Option<String>,
    /// Set when the fallback replaced the requested provider.
    pub fallback_from: Option<String>,
    pub fallback_reason: Option<String>,
    pub error: Option<String>,
}

pub struct ProviderSelection {
    pub embedder: Option<Arc<Embedder>>,
    pub status: ProviderStatus,
}

/// Builds embedding backends. Hosts and tests can supply their own.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, config: &ResolvedConfig) -> Result<EmbeddingBackend>;
}

/// Builds the providers compiled into this crate.
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, kind: ProviderKind, config: &ResolvedConfig) -> Result<EmbeddingBackend> {
        match kind {
            ProviderKind::None => bail!("embedding provider disabled"),
            ProviderKind::Local => create_local(config),
            ProviderKind::OpenAi | ProviderKind::Ollama => {
                let remote = RemoteProvider::new(kind, &config.provider)?;
                if kind == ProviderKind::OpenAi && config.batch.enabled {
                    let transport = Arc::new(OpenAiBatchTransport::new(&remote)?);
                    Ok(EmbeddingBackend::RemoteBatch(BatchProvider::new(
                        Arc::new(remote),
                        transport,
                        config.batch.clone(),
                    )))
                } else {
                    Ok(EmbeddingBackend::Remote(remote))
                }
            }
        }
    }
}

#[cfg(feature = "local-embeddings")]
fn create_local(config: &ResolvedConfig) -> Result<EmbeddingBackend> {
    Ok(EmbeddingBackend::Local(local::LocalProvider::new(
        &config.provider,
    )?))
}

#[cfg(not(feature = "local-embeddings"))]
fn create_local(_config: &ResolvedConfig) -> Result<EmbeddingBackend> {
    bail!("local embeddings require building with the `local-embeddings` feature")
}

/// Hands out one shared provider for every non-`none` kind.
pub struct StaticProviderFactory {
    provider: Arc<dyn EmbeddingProvider>,
}

impl StaticProviderFactory {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderFactory for StaticProviderFactory {
    fn create(&self, kind: ProviderKind, _config: &ResolvedConfig) -> Result<EmbeddingBackend> {
        if kind == ProviderKind::None {
            bail!("embedding provider disabled");
        }
        Ok(EmbeddingBackend::Custom(Arc::clone(&self.provider)))
    }
}

/// Build the configured provider, or its fallback when it cannot start.
pub fn select_provider(factory: &dyn ProviderFactory, config: &ResolvedConfig) -> ProviderSelection {
    let settings = &config.provider;
    let mut status = ProviderStatus {
        requested: settings.kind.as_str().to_string(),
        fallback: settings.fallback.map(|k| k.as_str().to_string()),
        ..ProviderStatus::default()
    };

    if settings.kind == ProviderKind::None {
        return ProviderSelection {
            embedder: None,
            status,
        };
    }

    let wrap = |backend: EmbeddingBackend| {
        Arc::new(Embedder::new(
            backend,
            RetryPolicy::new(settings.max_retries),
            settings.batch_size,
        ))
    };

    let primary_err = match factory.create(settings.kind, config) {
        Ok(backend) => {
            let embedder = wrap(backend);
            status.provider = Some(embedder.id().to_string());
            status.model = Some(embedder.model().to_string());
            return ProviderSelection {
                embedder: Some(embedder),
                status,
            };
        }
        Err(e) => e,
    };

    let Some(fallback) = settings.fallback else {
        warn!(provider = settings.kind.as_str(), error = %primary_err, "Embedding provider unavailable");
        status.error = Some(format!("{:#}", primary_err));
        return ProviderSelection {
            embedder: None,
            status,
        };
    };

    match factory.create(fallback, config) {
        Ok(backend) => {
            warn!(
                provider = settings.kind.as_str(),
                fallback = fallback.as_str(),
                error = %primary_err,
                "Embedding provider failed to start, using fallback"
            );
            let embedder = wrap(backend);
            status.provider = Some(embedder.id().to_string());
            status.model = Some(embedder.model().to_string());
            status.fallback_from = Some(settings.kind.as_str().to_string());
            status.fallback_reason = Some(format!("{:#}", primary_err));
            ProviderSelection {
                embedder: Some(embedder),
                status,
            }
        }
        Err(fallback_err) => {
            warn!(error = %fallback_err, "Fallback embedding provider unavailable");
            status.error = Some(format!(
                "{:#}; fallback {}: {:#}",
                primary_err,
                fallback.as_str(),
                fallback_err
            ));
            ProviderSelection {
                embedder: None,
                status,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use bridge_memory_core::cache::CacheSettings;
    use bridge_memory_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails with the scripted errors, then succeeds.
    struct Flaky {
        errors: Mutex<Vec<EmbeddingError>>,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(errors: Vec<EmbeddingError>) -> Self {
            Self {
                errors: Mutex::new(errors),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }
        fn model(&self) -> &str {
            "m"
        }
        fn dims(&self) -> Option<usize> {
            Some(2)
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.errors.lock().unwrap().pop();
            match next {
                Some(e) => Err(e),
                None => Ok(texts.iter().map(|t| vec![t.len() as f32, 0.0]).collect()),
            }
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::new(9);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(9), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let provider = Flaky::new(vec![
            EmbeddingError::Transient("503".into()),
            EmbeddingError::Transient("429".into()),
        ]);
        let out = embed_batch_with_retry(&provider, &["ab".into()], &RetryPolicy::new(3))
            .await
            .unwrap();
        assert_eq!(out, vec![vec![2.0, 0.0]]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_rejection() {
        let provider = Flaky::new(vec![EmbeddingError::Rejected("401".into())]);
        let err = embed_batch_with_retry(&provider, &["a".into()], &RetryPolicy::new(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Rejected(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_surfaces_last_error() {
        let provider = Flaky::new(vec![EmbeddingError::Transient("x".into()); 4]);
        let err = embed_batch_with_retry(&provider, &["a".into()], &RetryPolicy::new(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_embedder_normalizes_and_batches() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(Flaky::new(vec![]));
        let embedder = Embedder::new(
            EmbeddingBackend::Custom(provider),
            RetryPolicy::new(0),
            2,
        );
        let texts: Vec<String> = vec!["a".into(), "bbb".into(), "cc".into()];
        let out = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(out.len(), 3);
        for v in &out {
            assert!((v[0] - 1.0).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_embed_cached_hits_second_time() {
        let flaky = Arc::new(Flaky::new(vec![]));
        let provider: Arc<dyn EmbeddingProvider> = flaky.clone();
        let embedder = Embedder::new(EmbeddingBackend::Custom(provider), RetryPolicy::new(0), 8);
        let store = InMemoryStore::new();
        let cache = EmbeddingCache::new(CacheSettings::default(), embedder.provider_key());
        let items = vec![
            ("h1".to_string(), "one".to_string()),
            ("h2".to_string(), "two".to_string()),
            ("h1".to_string(), "one".to_string()),
        ];

        let first = embedder.embed_cached(&store, &cache, &items).await.unwrap();
        assert_eq!(first.hits, 0);
        assert_eq!(first.vectors.len(), 3);
        let second = embedder.embed_cached(&store, &cache, &items).await.unwrap();
        assert_eq!(second.hits, 3);
        assert_eq!(second.vectors, first.vectors);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingFactory;

    impl ProviderFactory for FailingFactory {
        fn create(&self, kind: ProviderKind, _config: &ResolvedConfig) -> Result<EmbeddingBackend> {
            match kind {
                ProviderKind::Ollama => Ok(EmbeddingBackend::Custom(Arc::new(Flaky::new(vec![])))),
                other => bail!("{} cannot start", other.as_str()),
            }
        }
    }

    fn resolved(provider: &str, fallback: &str) -> ResolvedConfig {
        let mut memory = MemoryConfig::default();
        memory.provider = provider.to_string();
        memory.fallback = fallback.to_string();
        memory.resolve().unwrap()
    }

    #[test]
    fn test_fallback_only_on_init_failure() {
        let selection = select_provider(&FailingFactory, &resolved("openai", "ollama"));
        assert!(selection.embedder.is_some());
        assert_eq!(selection.status.requested, "openai");
        assert_eq!(selection.status.fallback_from.as_deref(), Some("openai"));
        assert!(selection.status.fallback_reason.unwrap().contains("cannot start"));

        let direct = select_provider(&FailingFactory, &resolved("ollama", "openai"));
        assert!(direct.status.fallback_from.is_none());
    }

    #[test]
    fn test_no_provider_when_all_fail() {
        let selection = select_provider(&FailingFactory, &resolved("openai", "local"));
        assert!(selection.embedder.is_none());
        assert!(selection.status.error.unwrap().contains("fallback local"));

        let none = select_provider(&FailingFactory, &resolved("none", "none"));
        assert!(none.embedder.is_none());
        assert!(none.status.error.is_none());
    }
}
