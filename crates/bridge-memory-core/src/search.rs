//! Hybrid retrieval: lexical (BM25) and vector candidates fused by weight.
//!
//! The algorithm runs entirely through the [`Store`] trait. The caller
//! embeds the query (through the embedding cache) and supplies
//! [`SearchParams`]; this module never touches configuration or providers.
//!
//! # Scoring
//!
//! 1. Fetch `max_results × candidate_multiplier` candidates per engine.
//! 2. Lexical: rank each hit by its BM25 distance from the best hit and map
//!    it with [`bm25_rank_to_score`], so the best hit scores `1.0`.
//! 3. Vector: cosine similarity clamped to `[0, 1]`.
//! 4. Fuse on `(path, start_line, end_line)`:
//!    `score = w_vector × vector + w_text × text`, a missing side counting
//!    as `0`. The lexical snippet is shown when the chunk has one.
//! 5. Stable sort by score; ties keep first-seen order (vector hits first).
//! 6. Drop `score < min_score`, then truncate to `max_results`.
//!
//! When only one engine can run, its scores are used unweighted. When
//! neither can, the outcome is empty and carries a notice.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::Source;
use crate::store::{ChunkCandidate, Store};

pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.7;
pub const DEFAULT_TEXT_WEIGHT: f64 = 0.3;
pub const MIN_CANDIDATE_MULTIPLIER: usize = 1;
pub const MAX_CANDIDATE_MULTIPLIER: usize = 20;
pub const MAX_RESULTS: usize = 1_000;

/// Fusion weights. Always non-negative and summing to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HybridWeights {
    pub vector: f64,
    pub text: f64,
}

impl HybridWeights {
    /// Normalize a configured pair. Negative or non-finite inputs count as
    /// zero; a zero sum falls back to the defaults.
    pub fn normalized(vector: f64, text: f64) -> Self {
        let clean = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let (v, t) = (clean(vector), clean(text));
        let sum = v + t;
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            vector: v / sum,
            text: t / sum,
        }
    }
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: DEFAULT_VECTOR_WEIGHT,
            text: DEFAULT_TEXT_WEIGHT,
        }
    }
}

/// Map a BM25 rank (`0` = best) to a score in `(0, 1]`.
///
/// `r ≤ 0 → 1`, otherwise `0.5^r`, so `score(1) = 0.5` and larger ranks
/// decay towards zero. NaN maps to `0`.
pub fn bm25_rank_to_score(rank: f64) -> f64 {
    if rank.is_nan() {
        return 0.0;
    }
    if rank <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(rank)
}

/// Split a free-form query into `[alnum_]` terms for the lexical engine.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// One ranked, line-addressed hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySearchResult {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f64,
    pub snippet: String,
    pub source: Source,
}

/// A candidate after per-engine score mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub source: Source,
    pub score: f64,
    pub snippet: String,
}

impl ScoredHit {
    fn from_candidate(c: ChunkCandidate, score: f64) -> Self {
        Self {
            path: c.path,
            start_line: c.start_line,
            end_line: c.end_line,
            source: c.source,
            score,
            snippet: c.snippet,
        }
    }

    fn into_result(self) -> MemorySearchResult {
        MemorySearchResult {
            path: self.path,
            start_line: self.start_line,
            end_line: self.end_line,
            score: self.score,
            snippet: self.snippet,
            source: self.source,
        }
    }
}

/// Fuse vector and lexical hits on `(path, start_line, end_line)`.
///
/// The vector list is consumed first, so equal scores keep vector order.
pub fn merge_hybrid_results(
    vector: Vec<ScoredHit>,
    keyword: Vec<ScoredHit>,
    weights: HybridWeights,
) -> Vec<MemorySearchResult> {
    struct Fused {
        hit: ScoredHit,
        vector_score: f64,
        text_score: f64,
    }

    let mut fused: Vec<Fused> = Vec::with_capacity(vector.len() + keyword.len());
    let mut index: HashMap<(String, usize, usize), usize> = HashMap::new();

    for hit in vector {
        let key = (hit.path.clone(), hit.start_line, hit.end_line);
        match index.get(&key) {
            Some(&i) => {
                let entry = &mut fused[i];
                entry.vector_score = entry.vector_score.max(hit.score);
            }
            None => {
                index.insert(key, fused.len());
                fused.push(Fused {
                    vector_score: hit.score,
                    text_score: 0.0,
                    hit,
                });
            }
        }
    }

    for hit in keyword {
        let key = (hit.path.clone(), hit.start_line, hit.end_line);
        match index.get(&key) {
            Some(&i) => {
                let entry = &mut fused[i];
                entry.text_score = entry.text_score.max(hit.score);
                if !hit.snippet.is_empty() {
                    entry.hit.snippet = hit.snippet;
                }
            }
            None => {
                index.insert(key, fused.len());
                fused.push(Fused {
                    vector_score: 0.0,
                    text_score: hit.score,
                    hit,
                });
            }
        }
    }

    let mut results: Vec<MemorySearchResult> = fused
        .into_iter()
        .map(|f| {
            let mut hit = f.hit;
            hit.score = weights.vector * f.vector_score + weights.text * f.text_score;
            hit.into_result()
        })
        .collect();
    sort_by_score(&mut results);
    results
}

fn sort_by_score(results: &mut [MemorySearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Drop results below `min_score`, then keep the first `max_results`.
pub fn filter_and_truncate(
    mut results: Vec<MemorySearchResult>,
    min_score: f64,
    max_results: usize,
) -> Vec<MemorySearchResult> {
    results.retain(|r| r.score >= min_score);
    results.truncate(max_results);
    results
}

/// Map keyword candidates (BM25, lower is better) to scores.
pub fn score_keyword_candidates(candidates: Vec<ChunkCandidate>) -> Vec<ScoredHit> {
    let best = candidates
        .iter()
        .map(|c| c.raw_score)
        .filter(|s| s.is_finite())
        .fold(f64::INFINITY, f64::min);
    candidates
        .into_iter()
        .map(|c| {
            let rank = if c.raw_score.is_finite() && best.is_finite() {
                c.raw_score - best
            } else {
                f64::INFINITY
            };
            ScoredHit::from_candidate(c, bm25_rank_to_score(rank))
        })
        .collect()
}

/// Map vector candidates (cosine) to scores in `[0, 1]`.
pub fn score_vector_candidates(candidates: Vec<ChunkCandidate>) -> Vec<ScoredHit> {
    candidates
        .into_iter()
        .map(|c| {
            let score = if c.raw_score.is_finite() {
                c.raw_score.clamp(0.0, 1.0)
            } else {
                0.0
            };
            ScoredHit::from_candidate(c, score)
        })
        .collect()
}

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchParams {
    pub max_results: usize,
    pub min_score: f64,
    pub hybrid_enabled: bool,
    pub weights: HybridWeights,
    pub candidate_multiplier: usize,
    pub sources: Vec<Source>,
}

impl SearchParams {
    pub fn candidate_limit(&self) -> usize {
        self.max_results.clamp(1, MAX_RESULTS).saturating_mul(
            self.candidate_multiplier
                .clamp(MIN_CANDIDATE_MULTIPLIER, MAX_CANDIDATE_MULTIPLIER),
        )
    }
}

/// Inputs for one search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Pre-computed query embedding; `None` disables the vector pass.
    pub query_vec: Option<&'a [f32]>,
    /// Why `query_vec` is missing, surfaced when nothing else can run.
    pub vector_unavailable: Option<&'a str>,
    pub params: &'a SearchParams,
}

/// Which engines contributed to a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    VectorOnly,
    LexicalOnly,
    #[default]
    Unavailable,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<MemorySearchResult>,
    pub mode: SearchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_error: Option<String>,
    /// Set when no engine could answer, so an empty list is not mistaken
    /// for "no matches".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// Run a hybrid search against a [`Store`].
///
/// Engine failures never fail the search: the failing engine is skipped
/// and its error reported on the outcome.
pub async fn search(store: &dyn Store, req: &SearchRequest<'_>) -> SearchOutcome {
    let mut outcome = SearchOutcome::default();
    let query = req.query.trim();
    if query.is_empty() {
        outcome.mode = SearchMode::Hybrid;
        return outcome;
    }

    let params = req.params;
    let engines = store.engines();
    let limit = params.candidate_limit();

    let vector_block: Option<String> = match (req.query_vec, engines.vector.error()) {
        (None, _) => Some(
            req.vector_unavailable
                .unwrap_or("no embedding provider")
                .to_string(),
        ),
        (Some(_), Some(reason)) => Some(reason.to_string()),
        (Some(_), None) => None,
    };
    let lexical_block: Option<String> = engines.lexical.error().map(str::to_string);

    let run_vector = vector_block.is_none();

    let mut vector_hits = None;
    if let (true, Some(qv)) = (run_vector, req.query_vec) {
        match store.vector_search(qv, limit, &params.sources).await {
            Ok(c) => vector_hits = Some(score_vector_candidates(c)),
            Err(e) => outcome.vector_error = Some(format!("{:#}", e)),
        }
    } else {
        outcome.vector_error = vector_block;
    }

    // Lexical runs alongside vector in hybrid mode, or stands in for it.
    let run_lexical = lexical_block.is_none() && (params.hybrid_enabled || vector_hits.is_none());
    let mut keyword_hits = None;
    if run_lexical {
        let terms = query_terms(query);
        match store.keyword_search(&terms, limit, &params.sources).await {
            Ok(c) => keyword_hits = Some(score_keyword_candidates(c)),
            Err(e) => outcome.lexical_error = Some(format!("{:#}", e)),
        }
    } else if lexical_block.is_some() {
        outcome.lexical_error = lexical_block;
    }

    let merged = match (vector_hits, keyword_hits) {
        (Some(v), Some(k)) => {
            outcome.mode = SearchMode::Hybrid;
            merge_hybrid_results(v, k, params.weights)
        }
        (Some(hits), None) | (None, Some(hits)) => {
            outcome.mode = if run_vector && outcome.vector_error.is_none() {
                SearchMode::VectorOnly
            } else {
                SearchMode::LexicalOnly
            };
            let mut results: Vec<MemorySearchResult> =
                hits.into_iter().map(ScoredHit::into_result).collect();
            sort_by_score(&mut results);
            results
        }
        (None, None) => {
            outcome.mode = SearchMode::Unavailable;
            outcome.notice = Some(format!(
                "memory search unavailable (lexical: {}; vector: {})",
                outcome.lexical_error.as_deref().unwrap_or("not used"),
                outcome.vector_error.as_deref().unwrap_or("not used"),
            ));
            Vec::new()
        }
    };

    outcome.results = filter_and_truncate(merged, params.min_score, params.max_results);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_document;
    use crate::models::IndexedFile;
    use crate::store::memory::InMemoryStore;
    use crate::store::{Availability, EngineAvailability, IndexBatch};

    fn hit(path: &str, score: f64, snippet: &str) -> ScoredHit {
        ScoredHit {
            path: path.to_string(),
            start_line: 1,
            end_line: 5,
            source: Source::Memory,
            score,
            snippet: snippet.to_string(),
        }
    }

    fn params() -> SearchParams {
        SearchParams {
            max_results: 6,
            min_score: 0.0,
            hybrid_enabled: true,
            weights: HybridWeights::default(),
            candidate_multiplier: 4,
            sources: vec![Source::Memory, Source::Sessions],
        }
    }

    #[test]
    fn test_candidate_limit_is_bounded() {
        let p = SearchParams {
            max_results: usize::MAX,
            candidate_multiplier: usize::MAX,
            ..params()
        };
        assert_eq!(p.candidate_limit(), MAX_RESULTS * MAX_CANDIDATE_MULTIPLIER);
        assert_eq!(params().candidate_limit(), 24);
    }

    #[test]
    fn test_bm25_rank_to_score_properties() {
        assert_eq!(bm25_rank_to_score(0.0), 1.0);
        assert_eq!(bm25_rank_to_score(-3.0), 1.0);
        assert!((bm25_rank_to_score(1.0) - 0.5).abs() < 1e-12);
        let mut prev = 1.0;
        for i in 1..200 {
            let s = bm25_rank_to_score(i as f64 * 0.37);
            assert!(s <= prev, "not monotone at {}", i);
            assert!(s > 0.0 || i as f64 * 0.37 > 1000.0);
            prev = s;
        }
        assert_eq!(bm25_rank_to_score(f64::NAN), 0.0);
        assert_eq!(bm25_rank_to_score(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_weights_normalized() {
        let w = HybridWeights::normalized(2.0, 2.0);
        assert!((w.vector - 0.5).abs() < 1e-12);
        assert!((w.vector + w.text - 1.0).abs() < 1e-12);

        let w = HybridWeights::normalized(0.0, 0.0);
        assert_eq!(w, HybridWeights::default());

        let w = HybridWeights::normalized(-1.0, 3.0);
        assert_eq!(w.vector, 0.0);
        assert_eq!(w.text, 1.0);

        for (v, t) in [(0.1, 0.9), (7.0, 3.0), (0.0, 1.0), (1e-9, 1e9)] {
            let w = HybridWeights::normalized(v, t);
            assert!((w.vector + w.text - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_merge_order_and_lexical_snippet() {
        let vector = vec![hit("a", 0.9, "vec a"), hit("b", 0.2, "vec b")];
        let keyword = vec![hit("b", 0.8, "lex b"), hit("c", 0.7, "lex c")];
        let weights = HybridWeights::normalized(0.5, 0.5);

        let merged = merge_hybrid_results(vector, keyword, weights);
        let order: Vec<&str> = merged.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(merged[0].snippet, "lex b");
        assert!((merged[0].score - 0.5).abs() < 1e-12);
        assert!((merged[1].score - 0.45).abs() < 1e-12);
        assert!((merged[2].score - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_merge_ties_keep_vector_order() {
        let vector = vec![hit("x", 0.5, ""), hit("y", 0.5, "")];
        let keyword = vec![hit("z", 0.2, "")];
        let merged = merge_hybrid_results(vector, keyword, HybridWeights::default());
        let order: Vec<&str> = merged.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_filter_before_truncate() {
        let results = merge_hybrid_results(
            vec![hit("a", 0.9, ""), hit("b", 0.3, ""), hit("c", 0.8, "")],
            Vec::new(),
            HybridWeights::normalized(1.0, 0.0),
        );
        let out = filter_and_truncate(results, 0.5, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "a");
    }

    #[test]
    fn test_keyword_best_hit_scores_one() {
        let cands = vec![
            ChunkCandidate {
                chunk_id: "1".into(),
                path: "a".into(),
                source: Source::Memory,
                start_line: 1,
                end_line: 1,
                raw_score: -4.0,
                snippet: String::new(),
            },
            ChunkCandidate {
                chunk_id: "2".into(),
                path: "b".into(),
                source: Source::Memory,
                start_line: 1,
                end_line: 1,
                raw_score: -3.0,
                snippet: String::new(),
            },
        ];
        let hits = score_keyword_candidates(cands);
        assert_eq!(hits[0].score, 1.0);
        assert!((hits[1].score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("deploy: k8s-cluster!"), vec!["deploy", "k8s", "cluster"]);
        assert!(query_terms("  ?? ").is_empty());
    }

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        let generation = store.next_generation().await.unwrap();
        let mut batch = IndexBatch::new(generation);
        for (path, text, vec) in [
            ("memory/a.md", "release checklist for the bridge", vec![1.0, 0.0]),
            ("memory/b.md", "grocery list", vec![0.0, 1.0]),
        ] {
            let mut chunks = chunk_document(path, Source::Memory, text, 400, 0, generation);
            for c in &mut chunks {
                c.embedding = Some(vec.clone());
            }
            batch.stage_document(
                IndexedFile {
                    path: path.into(),
                    source: Source::Memory,
                    hash: "h".into(),
                    generation,
                    indexed_at: 0,
                },
                chunks,
            );
        }
        batch.commit(&store).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_hybrid() {
        let store = seeded_store().await;
        let p = params();
        let qv = [1.0f32, 0.0];
        let outcome = search(
            &store,
            &SearchRequest {
                query: "release",
                query_vec: Some(&qv),
                vector_unavailable: None,
                params: &p,
            },
        )
        .await;
        assert_eq!(outcome.mode, SearchMode::Hybrid);
        assert_eq!(outcome.results[0].path, "memory/a.md");
        assert!((outcome.results[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_search_without_provider_is_lexical_only() {
        let store = seeded_store().await;
        let p = params();
        let outcome = search(
            &store,
            &SearchRequest {
                query: "grocery",
                query_vec: None,
                vector_unavailable: Some("provider none"),
                params: &p,
            },
        )
        .await;
        assert_eq!(outcome.mode, SearchMode::LexicalOnly);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].path, "memory/b.md");
        assert_eq!(outcome.vector_error.as_deref(), Some("provider none"));
    }

    #[tokio::test]
    async fn test_search_hybrid_disabled_is_vector_only() {
        let store = seeded_store().await;
        let mut p = params();
        p.hybrid_enabled = false;
        let qv = [0.0f32, 1.0];
        let outcome = search(
            &store,
            &SearchRequest {
                query: "release",
                query_vec: Some(&qv),
                vector_unavailable: None,
                params: &p,
            },
        )
        .await;
        assert_eq!(outcome.mode, SearchMode::VectorOnly);
        assert_eq!(outcome.results[0].path, "memory/b.md");
    }

    #[tokio::test]
    async fn test_search_no_engines_sets_notice() {
        let store = seeded_store().await;
        store.set_engines(EngineAvailability {
            lexical: Availability::Unavailable("fts5 missing".into()),
            vector: Availability::Ready,
        });
        let p = params();
        let outcome = search(
            &store,
            &SearchRequest {
                query: "release",
                query_vec: None,
                vector_unavailable: None,
                params: &p,
            },
        )
        .await;
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.mode, SearchMode::Unavailable);
        let notice = outcome.notice.unwrap();
        assert!(notice.contains("fts5 missing"));
    }

    #[tokio::test]
    async fn test_empty_query() {
        let store = seeded_store().await;
        let p = params();
        let outcome = search(
            &store,
            &SearchRequest {
                query: "   ",
                query_vec: None,
                vector_unavailable: None,
                params: &p,
            },
        )
        .await;
        assert!(outcome.results.is_empty());
        assert!(outcome.notice.is_none());
    }
}
