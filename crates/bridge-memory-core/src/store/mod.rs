//! Index storage abstraction.
//!
//! The [`Store`] trait covers everything the sync engine, the embedding
//! cache and the search pipeline need from a tenant's index: generation
//! allocation, all-or-nothing batch commits, lexical and vector candidate
//! retrieval, session bookkeeping and cached vectors. A store instance is
//! bound to one tenant scope.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod batch;
pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{IndexMeta, IndexedFile, SessionRecord, Source, SourceCounts};

pub use batch::{CommitSummary, IndexBatch, StagedDocument};

/// A candidate chunk returned from keyword or vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub path: String,
    pub source: Source,
    pub start_line: usize,
    pub end_line: usize,
    /// Keyword search: BM25 value, lower is better.
    /// Vector search: cosine similarity, higher is better.
    pub raw_score: f64,
    pub snippet: String,
}

/// Whether a search engine can be used right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum Availability {
    Ready,
    Unavailable(String),
}

impl Availability {
    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Availability::Ready => None,
            Availability::Unavailable(reason) => Some(reason),
        }
    }
}

/// Availability of the lexical (FTS) and vector engines of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineAvailability {
    pub lexical: Availability,
    pub vector: Availability,
}

impl EngineAvailability {
    pub fn ready() -> Self {
        Self {
            lexical: Availability::Ready,
            vector: Availability::Ready,
        }
    }
}

/// Tenant-scoped index backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`next_generation`](Store::next_generation) | Allocate a generation tag for a sync pass |
/// | [`commit`](Store::commit) | Apply an [`IndexBatch`] atomically |
/// | [`keyword_search`](Store::keyword_search) | BM25 candidates for AND-ed terms |
/// | [`vector_search`](Store::vector_search) | Cosine candidates for a query vector |
/// | [`cache_get`](Store::cache_get) / [`cache_put`](Store::cache_put) | Embedding cache rows |
#[async_trait]
pub trait Store: Send + Sync {
    /// Current engine availability.
    fn engines(&self) -> EngineAvailability;

    async fn read_meta(&self) -> Result<Option<IndexMeta>>;

    async fn write_meta(&self, meta: &IndexMeta) -> Result<()>;

    /// Allocate a generation strictly greater than any handed out before.
    async fn next_generation(&self) -> Result<i64>;

    async fn list_files(&self) -> Result<Vec<IndexedFile>>;

    /// Apply a batch all-or-nothing: new chunks and vectors first, then
    /// older generations of the same documents, then removals. Searches
    /// observe either the state before or after, never a mix.
    async fn commit(&self, batch: &IndexBatch) -> Result<CommitSummary>;

    /// Chunks containing every term, best first.
    async fn keyword_search(
        &self,
        terms: &[String],
        limit: usize,
        sources: &[Source],
    ) -> Result<Vec<ChunkCandidate>>;

    /// Chunks by cosine similarity to `query_vec`, best first.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        sources: &[Source],
    ) -> Result<Vec<ChunkCandidate>>;

    /// File and chunk totals per source.
    async fn counts(&self) -> Result<Vec<SourceCounts>>;

    async fn list_session_records(&self) -> Result<Vec<SessionRecord>>;

    async fn get_session_record(&self, session_key: &str) -> Result<Option<SessionRecord>>;

    async fn upsert_session_record(&self, record: &SessionRecord) -> Result<()>;

    /// Cached vectors for the given content hashes under one provider key.
    async fn cache_get(
        &self,
        provider_key: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>>;

    async fn cache_put(&self, provider_key: &str, entries: &[(String, Vec<f32>)]) -> Result<()>;

    async fn cache_count(&self) -> Result<u64>;

    /// Evict the least recently written entries beyond `max_entries`.
    /// Returns how many were removed.
    async fn cache_prune(&self, max_entries: usize) -> Result<u64>;
}
