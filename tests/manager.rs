use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bridge_memory::backend::{InMemoryBackend, TenantStores};
use bridge_memory::config::{MemoryConfig, ResolvedConfig};
use bridge_memory::embedding::StaticProviderFactory;
use bridge_memory::manager::{MemoryManager, SearchOptions};
use bridge_memory::registry::ManagerRegistry;
use bridge_memory::sync::{SyncOptions, SyncReason};
use bridge_memory_core::content::memory::InMemoryContentStore;
use bridge_memory_core::content::ContentStore;
use bridge_memory_core::embedding::EmbeddingProvider;
use bridge_memory_core::error::EmbeddingError;
use bridge_memory_core::models::TenantScope;
use bridge_memory_core::search::SearchMode;
use bridge_memory_core::store::memory::InMemoryStore;
use bridge_memory_core::store::Store;

/// Two-dimensional vectors chosen so the query "zebra" sits at a known
/// cosine from each fixture note.
struct Fixed {
    calls: AtomicUsize,
    slow: AtomicBool,
}

impl Fixed {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            slow: AtomicBool::new(false),
        })
    }
}

fn fixed_vector(text: &str) -> Vec<f32> {
    if text.trim() == "zebra" {
        vec![1.0, 0.0]
    } else if text.contains("alpha") {
        vec![0.9, 0.435_89]
    } else if text.contains("zebra") {
        vec![0.6, 0.8]
    } else {
        vec![0.0, 1.0]
    }
}

#[async_trait]
impl EmbeddingProvider for Fixed {
    fn id(&self) -> &str {
        "fixed"
    }

    fn model(&self) -> &str {
        "fixed-2d"
    }

    fn dims(&self) -> Option<usize> {
        Some(2)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Only document text stalls, so queries still answer mid-sync.
        if self.slow.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains("bread")) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbeddingError::Rejected("poisoned input".into()));
        }
        Ok(texts.iter().map(|t| fixed_vector(t)).collect())
    }
}

fn config(edit: impl FnOnce(&mut MemoryConfig)) -> MemoryConfig {
    let mut memory = MemoryConfig {
        provider: "openai".to_string(),
        ..MemoryConfig::default()
    };
    memory.sync.watch = false;
    memory.query.min_score = 0.0;
    edit(&mut memory);
    memory
}

fn resolved(memory: &MemoryConfig) -> Arc<ResolvedConfig> {
    Arc::new(memory.resolve().unwrap())
}

struct Harness {
    manager: Arc<MemoryManager>,
    store: Arc<InMemoryStore>,
    content: Arc<InMemoryContentStore>,
    provider: Arc<Fixed>,
}

fn harness_with(
    memory: &MemoryConfig,
    store: Arc<InMemoryStore>,
    content: Arc<InMemoryContentStore>,
    provider: Arc<Fixed>,
) -> Harness {
    let manager = MemoryManager::new(
        TenantScope::new("matrix", "@alice:example.org", "default"),
        resolved(memory),
        TenantStores {
            store: store.clone(),
            content: content.clone(),
        },
        &StaticProviderFactory::new(provider.clone()),
    )
    .unwrap();
    Harness {
        manager: Arc::new(manager),
        store,
        content,
        provider,
    }
}

fn harness(memory: &MemoryConfig) -> Harness {
    harness_with(
        memory,
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryContentStore::new()),
        Fixed::new(),
    )
}

#[tokio::test]
async fn test_hybrid_prefers_keyword_match_over_closer_vector() {
    let h = harness(&config(|_| {}));
    h.manager
        .write_file("memory/a.md", "alpha notes about stripes", false)
        .await
        .unwrap();
    h.manager
        .write_file("memory/b.md", "a zebra was mentioned", false)
        .await
        .unwrap();

    let outcome = h
        .manager
        .search("zebra", SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.mode, SearchMode::Hybrid);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.results[0].path, "memory/b.md");
    assert_eq!(outcome.results[1].path, "memory/a.md");
    // 0.7 * 0.6 + 0.3 * 1.0
    assert!((outcome.results[0].score - 0.72).abs() < 1e-3);
    // 0.7 * 0.9
    assert!((outcome.results[1].score - 0.63).abs() < 1e-3);
    assert!(!h.manager.is_dirty());
}

#[tokio::test]
async fn test_search_overrides_clamp() {
    let h = harness(&config(|_| {}));
    h.manager
        .write_file("memory/a.md", "alpha notes", false)
        .await
        .unwrap();
    h.manager
        .write_file("memory/b.md", "a zebra", false)
        .await
        .unwrap();

    let opts = SearchOptions {
        max_results: Some(0),
        min_score: Some(7.0),
        deadline: None,
    };
    // min_score clamps to 1.0, which nothing reaches.
    let outcome = h.manager.search("zebra", opts).await.unwrap();
    assert!(outcome.results.is_empty());

    let opts = SearchOptions {
        max_results: Some(0),
        ..SearchOptions::default()
    };
    let outcome = h.manager.search("zebra", opts).await.unwrap();
    assert_eq!(outcome.results.len(), 1);

    let opts = SearchOptions {
        max_results: Some(usize::MAX),
        ..SearchOptions::default()
    };
    let outcome = h.manager.search("zebra", opts).await.unwrap();
    assert_eq!(outcome.results.len(), 2);
}

#[tokio::test]
async fn test_forced_resync_is_served_from_cache() {
    let h = harness(&config(|_| {}));
    h.manager
        .write_file("memory/a.md", "alpha notes", false)
        .await
        .unwrap();
    h.manager
        .write_file("MEMORY.md", "zebra facts", false)
        .await
        .unwrap();

    let first = h
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.indexed, 2);
    assert_eq!(first.cache_hits, 0);
    let calls = h.provider.calls.load(Ordering::SeqCst);

    let second = h
        .manager
        .sync(SyncOptions::forced(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.indexed, 2);
    assert_eq!(second.cache_misses, 0);
    assert!(second.cache_hits >= 2);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_lazy_sync_skips_clean_index() {
    let h = harness(&config(|_| {}));
    h.manager
        .write_file("memory/a.md", "alpha", false)
        .await
        .unwrap();

    let report = h
        .manager
        .sync(SyncOptions::new(SyncReason::Search))
        .await
        .unwrap();
    assert!(report.is_some());
    assert!(!h.manager.is_dirty());

    let report = h
        .manager
        .sync(SyncOptions::new(SyncReason::Search))
        .await
        .unwrap();
    assert!(report.is_none());
}

#[tokio::test]
async fn test_search_sees_old_generation_during_reindex() {
    let h = harness(&config(|m| m.sync.on_search = false));
    h.manager
        .write_file("memory/fruit.md", "apple pie recipe", false)
        .await
        .unwrap();
    h.manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap();

    h.manager
        .write_file("memory/fruit.md", "banana bread recipe", false)
        .await
        .unwrap();
    h.provider.slow.store(true, Ordering::SeqCst);

    let background = Arc::clone(&h.manager);
    let pass = tokio::spawn(async move {
        background
            .sync(SyncOptions::new(SyncReason::Manual))
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let during = h
        .manager
        .search("apple", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(during.results.len(), 1);
    assert!(during.results[0].snippet.contains("apple"));
    let banana = h
        .manager
        .search("banana", SearchOptions::default())
        .await
        .unwrap();
    assert!(banana.results.iter().all(|r| !r.snippet.contains("banana")));

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.indexed, 1);
    h.provider.slow.store(false, Ordering::SeqCst);

    let after = h
        .manager
        .search("banana", SearchOptions::default())
        .await
        .unwrap();
    assert!(after.results.iter().any(|r| r.snippet.contains("banana")));
    let chunks = h.store.chunks();
    assert!(chunks.iter().all(|c| !c.text.contains("apple")));
}

#[tokio::test]
async fn test_embedding_failure_keeps_index_dirty() {
    let h = harness(&config(|_| {}));
    h.manager
        .write_file("memory/ok.md", "alpha", false)
        .await
        .unwrap();
    h.manager
        .write_file("memory/bad.md", "poison", false)
        .await
        .unwrap();

    let report = h
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(h.manager.is_dirty());

    let status = h.manager.status().await.unwrap();
    assert!(status.last_sync_error.unwrap().contains("memory/bad.md"));
    assert_eq!(status.files, 1);
}

#[tokio::test]
async fn test_retention_prune_drops_old_transcripts() {
    let store = Arc::new(InMemoryStore::new());
    let content = Arc::new(InMemoryContentStore::new());
    let provider = Fixed::new();
    let now = chrono::Utc::now().timestamp();
    content
        .write_at("sessions/old.md", "user: zebra sighting\n", now - 10 * 86_400)
        .unwrap();
    content
        .write_at("sessions/new.md", "user: alpha plans\n", now)
        .unwrap();

    let keep_all = harness_with(&config(|_| {}), store.clone(), content.clone(), provider.clone());
    let report = keep_all
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.indexed, 2);
    keep_all.manager.close().await;

    let retained = harness_with(
        &config(|m| m.sync.sessions.retention_days = 1),
        store,
        content,
        provider,
    );
    let pruned = retained.manager.prune_sessions().await.unwrap();
    assert_eq!(pruned.sessions_removed, 1);
    assert!(pruned.chunks_deleted >= 1);

    let chunks = retained.store.chunks();
    assert!(chunks.iter().all(|c| c.path != "sessions/old.md"));
    assert!(chunks.iter().any(|c| c.path == "sessions/new.md"));
    // The transcript itself stays in the content store.
    assert!(retained
        .content
        .read("sessions/old.md")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_session_delta_marks_dirty_after_threshold() {
    let h = harness(&config(|m| {
        m.sync.sessions.delta_bytes = 1_000;
        m.sync.sessions.delta_messages = 3;
    }));
    h.manager
        .append_session("room", "user: hello\n")
        .await
        .unwrap();
    h.manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap();
    assert!(!h.manager.is_dirty());

    assert!(!h.manager.notify_session_delta("room", 10, 1).await.unwrap());
    assert!(!h.manager.is_dirty());
    assert!(h.manager.notify_session_delta("room", 10, 2).await.unwrap());
    assert!(h.manager.is_dirty());
}

#[tokio::test]
async fn test_session_messages_appended_during_sync_are_kept() {
    let h = harness(&config(|m| {
        m.sync.sessions.delta_bytes = 1_000_000;
        m.sync.sessions.delta_messages = 2;
    }));
    h.manager
        .append_session("room", "user: bread\n")
        .await
        .unwrap();
    h.provider.slow.store(true, Ordering::SeqCst);

    let background = Arc::clone(&h.manager);
    let pass = tokio::spawn(async move {
        background
            .sync(SyncOptions::new(SyncReason::Manual))
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.manager
        .append_session("room", "user: zebra one\n")
        .await
        .unwrap();
    h.manager
        .append_session("room", "user: zebra two\n")
        .await
        .unwrap();

    let first = pass.await.unwrap().unwrap();
    assert_eq!(first.indexed, 1);
    h.provider.slow.store(false, Ordering::SeqCst);
    assert!(h.manager.is_dirty());

    let record = h.store.get_session_record("room").await.unwrap().unwrap();
    assert_eq!(record.pending_messages, 2);
    assert!(record.indexed_at.is_some());

    let second = h
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.indexed, 1);
    assert!(h.store.chunks().iter().any(|c| c.text.contains("zebra two")));
    let record = h.store.get_session_record("room").await.unwrap().unwrap();
    assert_eq!(record.pending_messages, 0);
}

#[tokio::test]
async fn test_prune_keeps_recently_edited_transcript() {
    let h = harness(&config(|m| {
        m.sync.sessions.retention_days = 1;
        m.sync.sessions.delta_bytes = 1_000_000;
        m.sync.sessions.delta_messages = 50;
    }));
    let now = chrono::Utc::now().timestamp();
    h.content
        .write_at("sessions/room.md", "user: alpha\n", now - 12 * 3_600)
        .unwrap();
    let first = h
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.indexed, 1);

    h.content
        .write_at("sessions/room.md", "user: alpha\nuser: more\n", now)
        .unwrap();
    let second = h
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.indexed, 0);
    assert_eq!(second.expired, 0);

    let pruned = h.manager.prune_sessions_at(now + 14 * 3_600).await.unwrap();
    assert_eq!(pruned.sessions_removed, 0);
    assert!(h.store.chunks().iter().any(|c| c.path == "sessions/room.md"));
    assert!(!h.manager.is_dirty());

    // Once it really expires, the tenant is left dirty so a pass revisits it.
    let pruned = h.manager.prune_sessions_at(now + 3 * 86_400).await.unwrap();
    assert_eq!(pruned.sessions_removed, 1);
    assert!(h.manager.is_dirty());
    let rebuilt = h
        .manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rebuilt.indexed, 1);
    assert!(h.store.chunks().iter().any(|c| c.text.contains("more")));
}

#[tokio::test]
async fn test_notify_ignores_unindexable_paths() {
    let h = harness(&config(|_| {}));
    h.manager
        .sync(SyncOptions::new(SyncReason::Manual))
        .await
        .unwrap();
    assert!(!h.manager.is_dirty());

    assert!(!h.manager.notify_file_changed("notes/todo.txt").unwrap());
    assert!(!h.manager.notify_file_changed("../escape.md").unwrap());
    assert!(!h.manager.is_dirty());
    assert!(h.manager.notify_file_changed("memory/x.md").unwrap());
    assert!(h.manager.is_dirty());
}

#[tokio::test]
async fn test_warm_session_once_per_key() {
    let h = harness(&config(|_| {}));
    assert!(h.manager.warm_session("room").unwrap());
    assert!(!h.manager.warm_session("room").unwrap());
    assert!(h.manager.warm_session("other").unwrap());
    h.manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_watch_debounce_triggers_sync() {
    let h = harness(&config(|m| {
        m.sync.watch = true;
        m.sync.watch_debounce_ms = 1_000;
    }));
    h.manager
        .write_file("memory/a.md", "alpha", false)
        .await
        .unwrap();
    assert!(h.manager.is_dirty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.manager.is_dirty());
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(!h.manager.is_dirty());
    assert_eq!(h.store.chunks().len(), 1);
    h.manager.close().await;
}

#[tokio::test]
async fn test_probes_and_status() {
    let h = harness(&config(|_| {}));
    assert!(h.manager.probe_vector_availability().is_ready());
    assert!(h.manager.probe_embedding_availability().await.is_ready());

    let status = h.manager.status().await.unwrap();
    assert_eq!(status.tenant, "matrix/@alice:example.org/default");
    assert_eq!(status.provider.provider.as_deref(), Some("fixed"));
    assert!(status.vector.available);
    assert!(status.dirty);

    let off = harness(&config(|m| m.provider = "none".to_string()));
    assert!(!off.manager.probe_vector_availability().is_ready());
    assert!(!off.manager.probe_embedding_availability().await.is_ready());
}

#[tokio::test]
async fn test_write_rejects_paths_outside_memory() {
    let h = harness(&config(|_| {}));
    assert!(h
        .manager
        .write_file("../secrets.md", "x", false)
        .await
        .is_err());
    assert!(h
        .manager
        .write_file("notes/todo.txt", "x", false)
        .await
        .is_err());
    let read = h.manager.read_file("memory/missing.md", None, None).await;
    assert!(read.is_err());
}

#[tokio::test]
async fn test_registry_reuses_and_rebuilds_on_config_change() {
    let registry = ManagerRegistry::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(StaticProviderFactory::new(Fixed::new())),
    );
    let scope = TenantScope::new("matrix", "@bob:example.org", "default");
    let memory = config(|_| {});

    let first = registry.get(&scope, &memory).await.unwrap();
    let again = registry.get(&scope, &memory).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    first
        .write_file("memory/a.md", "alpha", false)
        .await
        .unwrap();

    let changed = config(|m| m.query.max_results = 3);
    let rebuilt = registry.get(&scope, &changed).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(rebuilt.config().search.max_results, 3);
    assert_eq!(registry.len().await, 1);

    // Stores outlive the manager.
    let read = rebuilt.read_file("memory/a.md", None, None).await.unwrap();
    assert_eq!(read.text, "alpha");

    let other = TenantScope::new("matrix", "@carol:example.org", "default");
    registry.get(&other, &memory).await.unwrap();
    assert_eq!(registry.len().await, 2);
    assert!(registry.evict(&other).await);
    registry.close_all().await;
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_registry_drops_unused_resolved_configs() {
    let registry = ManagerRegistry::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(StaticProviderFactory::new(Fixed::new())),
    );
    let scope = TenantScope::new("matrix", "@bob:example.org", "default");
    let other = TenantScope::new("matrix", "@carol:example.org", "default");
    let memory = config(|_| {});

    registry.get(&scope, &memory).await.unwrap();
    assert_eq!(registry.resolved_len(), 1);

    let changed = config(|m| m.query.max_results = 3);
    registry.get(&scope, &changed).await.unwrap();
    assert_eq!(registry.resolved_len(), 1);

    registry.get(&other, &memory).await.unwrap();
    assert_eq!(registry.resolved_len(), 2);
    assert!(registry.evict(&other).await);
    assert_eq!(registry.resolved_len(), 1);

    registry.close_all().await;
    assert_eq!(registry.resolved_len(), 0);
}
