//! In-memory [`Store`] implementation for tests and ephemeral tenants.
//!
//! All state sits behind one `RwLock`, so a batch commit is atomic with
//! respect to concurrent searches. Keyword search is a small Okapi BM25
//! over lowercased `[alnum_]` terms, reported with FTS5's sign convention
//! (negative, lower is better). Vector search is brute-force cosine.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, IndexMeta, IndexedFile, SessionRecord, Source, SourceCounts};
use crate::search::query_terms;

use super::{Availability, ChunkCandidate, CommitSummary, EngineAvailability, IndexBatch, Store};

const SNIPPET_CHARS: usize = 240;
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct CacheEntry {
    vector: Vec<f32>,
    written: u64,
}

#[derive(Default)]
struct State {
    meta: Option<IndexMeta>,
    generation: i64,
    files: HashMap<String, IndexedFile>,
    chunks: Vec<Chunk>,
    sessions: HashMap<String, SessionRecord>,
    cache: HashMap<(String, String), CacheEntry>,
    cache_clock: u64,
}

/// In-memory store for tests and tenants that do not need persistence.
pub struct InMemoryStore {
    state: RwLock<State>,
    engines: RwLock<EngineAvailability>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            engines: RwLock::new(EngineAvailability::ready()),
        }
    }

    /// Simulate an engine failing or recovering.
    pub fn set_engines(&self, engines: EngineAvailability) {
        if let Ok(mut guard) = self.engines.write() {
            *guard = engines;
        }
    }

    /// Every chunk currently visible, for assertions.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.state
            .read()
            .map(|s| s.chunks.clone())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    query_terms(text).into_iter().map(|t| t.to_lowercase()).collect()
}

fn lead_snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

/// Window starting at the first line that mentions any term.
fn match_snippet(text: &str, terms: &[String]) -> String {
    let start = text
        .lines()
        .position(|line| {
            let lower = line.to_lowercase();
            terms.iter().any(|t| lower.contains(t.as_str()))
        })
        .unwrap_or(0);
    let window = text.lines().skip(start).collect::<Vec<_>>().join("\n");
    lead_snippet(&window)
}

#[async_trait]
impl Store for InMemoryStore {
    fn engines(&self) -> EngineAvailability {
        self.engines
            .read()
            .map(|e| e.clone())
            .unwrap_or_else(|_| EngineAvailability {
                lexical: Availability::Unavailable("engine lock poisoned".into()),
                vector: Availability::Unavailable("engine lock poisoned".into()),
            })
    }

    async fn read_meta(&self) -> Result<Option<IndexMeta>> {
        Ok(self.read()?.meta.clone())
    }

    async fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        self.write()?.meta = Some(meta.clone());
        Ok(())
    }

    async fn next_generation(&self) -> Result<i64> {
        let mut state = self.write()?;
        state.generation += 1;
        Ok(state.generation)
    }

    async fn list_files(&self) -> Result<Vec<IndexedFile>> {
        let mut files: Vec<IndexedFile> = self.read()?.files.values().cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn commit(&self, batch: &IndexBatch) -> Result<CommitSummary> {
        let mut state = self.write()?;
        let mut summary = CommitSummary::default();

        for doc in &batch.documents {
            for chunk in &doc.chunks {
                state.chunks.push(chunk.clone());
            }
            summary.chunks_written += doc.chunks.len();
            summary.documents += 1;
        }

        for doc in &batch.documents {
            let before = state.chunks.len();
            state
                .chunks
                .retain(|c| c.path != doc.file.path || c.generation >= batch.generation);
            summary.chunks_deleted += before - state.chunks.len();
            state.files.insert(doc.file.path.clone(), doc.file.clone());
        }

        let removed: HashSet<&str> = batch.removed_paths.iter().map(String::as_str).collect();
        if !removed.is_empty() {
            let before = state.chunks.len();
            state.chunks.retain(|c| !removed.contains(c.path.as_str()));
            summary.chunks_deleted += before - state.chunks.len();
            for path in &removed {
                if state.files.remove(*path).is_some() {
                    summary.paths_removed += 1;
                }
            }
        }

        for key in &batch.removed_sessions {
            state.sessions.remove(key);
        }

        Ok(summary)
    }

    async fn keyword_search(
        &self,
        terms: &[String],
        limit: usize,
        sources: &[Source],
    ) -> Result<Vec<ChunkCandidate>> {
        let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;

        let docs: Vec<(&Chunk, Vec<String>)> = state
            .chunks
            .iter()
            .filter(|c| sources.contains(&c.source))
            .map(|c| (c, tokenize(&c.text)))
            .collect();
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let n = docs.len() as f64;
        let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;
        let doc_freq: HashMap<&str, f64> = terms
            .iter()
            .map(|term| {
                let df = docs.iter().filter(|(_, toks)| toks.contains(term)).count();
                (term.as_str(), df as f64)
            })
            .collect();

        let mut candidates: Vec<ChunkCandidate> = docs
            .iter()
            .filter(|(_, toks)| terms.iter().all(|t| toks.contains(t)))
            .map(|(chunk, toks)| {
                let len = toks.len() as f64;
                let score: f64 = terms
                    .iter()
                    .map(|term| {
                        let tf = toks.iter().filter(|t| *t == term).count() as f64;
                        let df = doc_freq.get(term.as_str()).copied().unwrap_or(0.0);
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                        idf * tf * (BM25_K1 + 1.0) / (tf + norm)
                    })
                    .sum();
                ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    path: chunk.path.clone(),
                    source: chunk.source,
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    raw_score: -score,
                    snippet: match_snippet(&chunk.text, &terms),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.raw_score
                .partial_cmp(&b.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        sources: &[Source],
    ) -> Result<Vec<ChunkCandidate>> {
        let state = self.read()?;
        let mut candidates: Vec<ChunkCandidate> = state
            .chunks
            .iter()
            .filter(|c| sources.contains(&c.source))
            .filter_map(|c| {
                let embedding = c.embedding.as_ref()?;
                Some(ChunkCandidate {
                    chunk_id: c.id.clone(),
                    path: c.path.clone(),
                    source: c.source,
                    start_line: c.start_line,
                    end_line: c.end_line,
                    raw_score: cosine_similarity(query_vec, embedding) as f64,
                    snippet: lead_snippet(&c.text),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn counts(&self) -> Result<Vec<SourceCounts>> {
        let state = self.read()?;
        Ok(Source::ALL
            .iter()
            .map(|source| SourceCounts {
                source: source.as_str().to_string(),
                files: state.files.values().filter(|f| f.source == *source).count() as u64,
                chunks: state.chunks.iter().filter(|c| c.source == *source).count() as u64,
            })
            .collect())
    }

    async fn list_session_records(&self) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self.read()?.sessions.values().cloned().collect();
        records.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        Ok(records)
    }

    async fn get_session_record(&self, session_key: &str) -> Result<Option<SessionRecord>> {
        Ok(self.read()?.sessions.get(session_key).cloned())
    }

    async fn upsert_session_record(&self, record: &SessionRecord) -> Result<()> {
        self.write()?
            .sessions
            .insert(record.session_key.clone(), record.clone());
        Ok(())
    }

    async fn cache_get(
        &self,
        provider_key: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let state = self.read()?;
        Ok(hashes
            .iter()
            .filter_map(|h| {
                state
                    .cache
                    .get(&(provider_key.to_string(), h.clone()))
                    .map(|e| (h.clone(), e.vector.clone()))
            })
            .collect())
    }

    async fn cache_put(&self, provider_key: &str, entries: &[(String, Vec<f32>)]) -> Result<()> {
        let mut state = self.write()?;
        for (hash, vector) in entries {
            state.cache_clock += 1;
            let written = state.cache_clock;
            state.cache.insert(
                (provider_key.to_string(), hash.clone()),
                CacheEntry {
                    vector: vector.clone(),
                    written,
                },
            );
        }
        Ok(())
    }

    async fn cache_count(&self) -> Result<u64> {
        Ok(self.read()?.cache.len() as u64)
    }

    async fn cache_prune(&self, max_entries: usize) -> Result<u64> {
        let mut state = self.write()?;
        if state.cache.len() <= max_entries {
            return Ok(0);
        }
        let mut order: Vec<((String, String), u64)> = state
            .cache
            .iter()
            .map(|(k, e)| (k.clone(), e.written))
            .collect();
        order.sort_by_key(|(_, written)| *written);
        let excess = state.cache.len() - max_entries;
        for (key, _) in order.into_iter().take(excess) {
            state.cache.remove(&key);
        }
        Ok(excess as u64)
    }
}
