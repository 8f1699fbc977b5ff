//! Incremental indexing of a tenant's content store.
//!
//! A sync pass compares the content store against the index, re-chunks and
//! re-embeds the stale documents under one fresh generation, and commits
//! everything as a single [`IndexBatch`]. Search never observes a document
//! half re-indexed: the old generation stays visible until the commit swaps
//! it out.
//!
//! # Staleness
//!
//! | Document | Stale when |
//! |----------|-----------|
//! | note | hash differs from the indexed file, or not indexed, or full re-index |
//! | session transcript | hash differs AND (pending delta reached, or never indexed, or forced, or full re-index) |
//!
//! A full re-index happens when the stored [`IndexMeta`] differs from the
//! current provider or chunking settings. A pass that cannot embed records
//! no provider, so the first pass that can embed re-indexes everything.
//! Transcripts past retention are skipped and dropped from the index.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::{anyhow, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use bridge_memory_core::cache::EmbeddingCache;
use bridge_memory_core::chunk::chunk_document;
use bridge_memory_core::content::{ContentMeta, ContentStore};
use bridge_memory_core::models::{Chunk, IndexMeta, IndexedFile, SessionRecord, Source};
use bridge_memory_core::paths::{PathRules, SESSIONS_PREFIX};
use bridge_memory_core::store::{IndexBatch, Store};

use crate::config::ResolvedConfig;
use crate::embedding::Embedder;

/// Documents chunked and embedded concurrently within one pass.
const PREPARE_CONCURRENCY: usize = 4;
const SECONDS_PER_DAY: i64 = 86_400;

/// Everything a sync pass reads from or writes to.
pub struct SyncContext<'a> {
    pub config: &'a ResolvedConfig,
    pub rules: &'a PathRules,
    pub store: &'a dyn Store,
    pub content: &'a dyn ContentStore,
    pub embedder: Option<&'a Embedder>,
    pub cache: &'a EmbeddingCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    Manual,
    Search,
    SessionStart,
    Watch,
    Interval,
}

impl SyncReason {
    /// Lazy triggers skip the pass when the tenant is clean.
    pub fn is_lazy(&self) -> bool {
        matches!(self, SyncReason::Search | SyncReason::Watch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub reason: SyncReason,
    /// Re-index transcripts whose delta thresholds were not reached.
    pub force: bool,
}

impl SyncOptions {
    pub fn new(reason: SyncReason) -> Self {
        Self {
            reason,
            force: false,
        }
    }

    pub fn forced(reason: SyncReason) -> Self {
        Self {
            reason,
            force: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub reason: SyncReason,
    pub generation: i64,
    pub full_reindex: bool,
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub expired: usize,
    pub removed: usize,
    pub chunks_written: usize,
    pub chunks_deleted: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_pruned: u64,
    pub failed: Vec<SyncFailure>,
    pub finished_at: i64,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub sessions_removed: usize,
    pub chunks_deleted: usize,
}

/// `sessions/<key>.md` → `<key>`.
pub fn session_key_for_path(path: &str) -> Option<&str> {
    path.strip_prefix(SESSIONS_PREFIX)?.strip_suffix(".md")
}

fn retention_cutoff(retention_days: u64, now: i64) -> Option<i64> {
    (retention_days > 0).then(|| now - retention_days as i64 * SECONDS_PER_DAY)
}

/// The meta a pass writes. Provider fields stay empty when the pass does
/// not embed, so a later pass that can embed sees a mismatch and re-embeds.
fn desired_meta(ctx: &SyncContext<'_>, embed: bool) -> IndexMeta {
    let embedder = ctx.embedder.filter(|_| embed);
    IndexMeta {
        provider_key: embedder.map(|e| e.provider_key()),
        model: embedder.map(|e| e.model().to_string()),
        chunk_tokens: ctx.config.chunking.tokens,
        chunk_overlap: ctx.config.chunking.overlap,
        vector_dims: None,
    }
}

/// Everything but the dimensions, which are only known after embedding.
fn meta_matches(stored: &IndexMeta, desired: &IndexMeta) -> bool {
    stored.provider_key == desired.provider_key
        && stored.model == desired.model
        && stored.chunk_tokens == desired.chunk_tokens
        && stored.chunk_overlap == desired.chunk_overlap
}

struct Prepared {
    file: IndexedFile,
    chunks: Vec<Chunk>,
    hits: usize,
    misses: usize,
}

async fn prepare_document(
    ctx: &SyncContext<'_>,
    meta: &ContentMeta,
    source: Source,
    generation: i64,
    embed: bool,
    now: i64,
) -> Result<Prepared> {
    let entry = ctx
        .content
        .read(&meta.path)
        .await?
        .ok_or_else(|| anyhow!("document vanished during sync"))?;

    let mut chunks = chunk_document(
        &meta.path,
        source,
        &entry.content,
        ctx.config.chunking.tokens,
        ctx.config.chunking.overlap,
        generation,
    );

    let (mut hits, mut misses) = (0, 0);
    if let (true, Some(embedder)) = (embed, ctx.embedder) {
        if !chunks.is_empty() {
            let items: Vec<(String, String)> = chunks
                .iter()
                .map(|c| (c.hash.clone(), c.text.clone()))
                .collect();
            let embedded = embedder.embed_cached(ctx.store, ctx.cache, &items).await?;
            hits = embedded.hits;
            misses = embedded.misses;
            for (chunk, vector) in chunks.iter_mut().zip(embedded.vectors) {
                chunk.embedding = Some(vector);
            }
        }
    }

    Ok(Prepared {
        file: IndexedFile {
            path: meta.path.clone(),
            source,
            hash: entry.meta.hash,
            generation,
            indexed_at: now,
        },
        chunks,
        hits,
        misses,
    })
}

/// Run one sync pass.
///
/// Per-document failures are reported on the returned [`SyncReport`];
/// only store-level failures (listing, generation, commit) return `Err`,
/// in which case nothing was committed.
pub async fn run_sync(ctx: &SyncContext<'_>, opts: SyncOptions) -> Result<SyncReport> {
    let started = Instant::now();
    let now = chrono::Utc::now().timestamp();
    let config = ctx.config;

    let embed = config.vector_enabled
        && ctx.embedder.is_some()
        && ctx.store.engines().vector.is_ready();

    let desired = desired_meta(ctx, embed);
    let stored = ctx.store.read_meta().await?;
    let full_reindex = match &stored {
        Some(meta) => !meta_matches(meta, &desired),
        None => true,
    };

    let documents = ctx.content.list().await?;
    let indexed: HashMap<String, IndexedFile> = ctx
        .store
        .list_files()
        .await?
        .into_iter()
        .map(|f| (f.path.clone(), f))
        .collect();
    let records: HashMap<String, SessionRecord> = ctx
        .store
        .list_session_records()
        .await?
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();
    let cutoff = retention_cutoff(config.sync.retention_days, now);

    let mut live: HashSet<String> = HashSet::new();
    let mut stale: Vec<(ContentMeta, Source)> = Vec::new();
    let mut live_sessions: Vec<ContentMeta> = Vec::new();
    let mut expired: Vec<(String, String)> = Vec::new();
    let mut unchanged = 0;

    for doc in &documents {
        let Some(source) = ctx.rules.classify(&doc.path) else {
            continue;
        };
        let previous = indexed.get(&doc.path);
        let hash_changed = previous.map(|f| f.hash != doc.hash).unwrap_or(true);

        let is_stale = match source {
            Source::Memory => full_reindex || hash_changed,
            Source::Sessions => {
                let record = records.get(&doc.path);
                let last_activity = record
                    .map(|r| r.updated_at.max(doc.updated_at))
                    .unwrap_or(doc.updated_at);
                if cutoff.is_some_and(|c| last_activity < c) {
                    if let Some(key) = session_key_for_path(&doc.path) {
                        expired.push((key.to_string(), doc.path.clone()));
                    }
                    continue;
                }
                live_sessions.push(doc.clone());
                let due = match record {
                    None => true,
                    Some(r) => {
                        r.indexed_at.is_none()
                            || r.delta_reached(
                                config.sync.delta_bytes,
                                config.sync.delta_messages,
                            )
                    }
                };
                full_reindex
                    || (hash_changed && (due || opts.force || previous.is_none()))
            }
        };

        live.insert(doc.path.clone());
        if is_stale {
            stale.push((doc.clone(), source));
        } else {
            unchanged += 1;
        }
    }

    let generation = ctx.store.next_generation().await?;
    let mut batch = IndexBatch::new(generation);
    let mut report = SyncReport {
        reason: opts.reason,
        generation,
        full_reindex,
        scanned: documents.len(),
        indexed: 0,
        unchanged,
        expired: expired.len(),
        removed: 0,
        chunks_written: 0,
        chunks_deleted: 0,
        cache_hits: 0,
        cache_misses: 0,
        cache_pruned: 0,
        failed: Vec::new(),
        finished_at: now,
        duration_ms: 0,
    };

    let jobs: Vec<BoxFuture<'_, Result<Prepared>>> = stale
        .iter()
        .map(|(meta, source)| prepare_document(ctx, meta, *source, generation, embed, now).boxed())
        .collect();
    let prepared: Vec<Result<Prepared>> = stream::iter(jobs)
        .buffered(PREPARE_CONCURRENCY)
        .collect()
        .await;

    let mut dims = None;
    let mut indexed_sessions: HashSet<String> = HashSet::new();
    for ((meta, source), outcome) in stale.iter().zip(prepared) {
        match outcome {
            Ok(doc) => {
                report.cache_hits += doc.hits;
                report.cache_misses += doc.misses;
                if dims.is_none() {
                    dims = doc
                        .chunks
                        .iter()
                        .find_map(|c| c.embedding.as_ref().map(Vec::len));
                }
                if *source == Source::Sessions {
                    indexed_sessions.insert(meta.path.clone());
                }
                batch.stage_document(doc.file, doc.chunks);
            }
            Err(e) => {
                warn!(path = %meta.path, error = %format!("{:#}", e), "Failed to index document");
                report.failed.push(SyncFailure {
                    path: meta.path.clone(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    let expired_paths: HashSet<&str> = expired.iter().map(|(_, p)| p.as_str()).collect();
    for (key, path) in &expired {
        batch.stage_session_removal(key.clone(), path.clone());
    }
    for path in indexed.keys() {
        if !live.contains(path) && !expired_paths.contains(path.as_str()) {
            batch.stage_removal(path.clone());
        }
    }

    report.indexed = batch.documents.len();
    let summary = batch.commit(ctx.store).await?;
    report.chunks_written = summary.chunks_written;
    report.chunks_deleted = summary.chunks_deleted;
    report.removed = summary.paths_removed;

    // Session bookkeeping after the commit is visible. Records are re-read
    // so deltas accounted while the pass ran are kept; only the counts seen
    // at the start of the pass are consumed.
    for doc in &live_sessions {
        let Some(key) = session_key_for_path(&doc.path) else {
            continue;
        };
        let seen = records.get(&doc.path);
        let current = ctx.store.get_session_record(key).await?;
        let was_indexed = indexed_sessions.contains(&doc.path);
        let mut record = match current {
            Some(record) => record,
            None => {
                let mut record = SessionRecord::new(key, &doc.path, doc.updated_at);
                if !was_indexed {
                    record.indexed_at = indexed.get(&doc.path).map(|f| f.indexed_at);
                }
                record
            }
        };
        let mut changed = seen.is_none() || doc.updated_at > record.updated_at;
        record.updated_at = record.updated_at.max(doc.updated_at);
        if was_indexed {
            let (bytes, messages) = seen
                .map(|r| (r.pending_bytes, r.pending_messages))
                .unwrap_or_default();
            record.pending_bytes = record.pending_bytes.saturating_sub(bytes);
            record.pending_messages = record.pending_messages.saturating_sub(messages);
            record.indexed_at = Some(now);
            changed = true;
        }
        if changed {
            ctx.store.upsert_session_record(&record).await?;
        }
    }

    // A failed full re-index keeps the old meta so the next pass retries it.
    if report.failed.is_empty() {
        let vector_dims = dims
            .or_else(|| stored.as_ref().and_then(|m| m.vector_dims).filter(|_| !full_reindex))
            .or_else(|| ctx.embedder.and_then(|e| e.dims()));
        ctx.store
            .write_meta(&IndexMeta {
                vector_dims: desired.provider_key.as_ref().and(vector_dims),
                ..desired
            })
            .await?;
    }

    report.cache_pruned = match ctx.cache.prune(ctx.store).await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Embedding cache prune failed");
            0
        }
    };

    report.duration_ms = started.elapsed().as_millis() as u64;
    if report.indexed > 0 || report.removed > 0 || !report.failed.is_empty() {
        info!(
            reason = ?report.reason,
            generation,
            indexed = report.indexed,
            removed = report.removed,
            failed = report.failed.len(),
            cache_hits = report.cache_hits,
            duration_ms = report.duration_ms,
            "Memory sync complete"
        );
    } else {
        debug!(reason = ?report.reason, "Memory sync found nothing to do");
    }
    Ok(report)
}

/// Drop session records (with their chunks and vectors) whose last
/// activity is older than `retention_days`. A zero retention prunes
/// nothing.
pub async fn prune_sessions(store: &dyn Store, retention_days: u64, now: i64) -> Result<PruneReport> {
    let Some(cutoff) = retention_cutoff(retention_days, now) else {
        return Ok(PruneReport::default());
    };

    let expired: Vec<SessionRecord> = store
        .list_session_records()
        .await?
        .into_iter()
        .filter(|r| r.updated_at < cutoff)
        .collect();
    if expired.is_empty() {
        return Ok(PruneReport::default());
    }

    let mut batch = IndexBatch::new(0);
    for record in &expired {
        batch.stage_session_removal(record.session_key.clone(), record.path.clone());
    }
    let summary = batch.commit(store).await?;

    info!(
        sessions = expired.len(),
        chunks = summary.chunks_deleted,
        retention_days,
        "Pruned expired sessions"
    );
    Ok(PruneReport {
        sessions_removed: expired.len(),
        chunks_deleted: summary.chunks_deleted,
    })
}
