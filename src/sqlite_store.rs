//! SQLite-backed [`Store`] for one tenant scope.
//!
//! Lexical search uses the FTS5 table `memory_chunks_fts` and its `bm25()`
//! ranking. Vectors are stored as little-endian f32 BLOBs in
//! `memory_chunk_vectors` and scored by brute-force cosine similarity in
//! Rust. A batch commit is a single transaction, so readers on other pool
//! connections see either the previous generation or the new one.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};

use bridge_memory_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use bridge_memory_core::models::{
    IndexMeta, IndexedFile, SessionRecord, Source, SourceCounts, TenantScope,
};
use bridge_memory_core::store::{
    Availability, ChunkCandidate, CommitSummary, EngineAvailability, IndexBatch, Store,
};

const SNIPPET_CHARS: usize = 240;
/// Keeps `IN (...)` lists under SQLite's bound-parameter limit.
const CACHE_LOOKUP_GROUP: usize = 400;

pub struct SqliteStore {
    pool: SqlitePool,
    scope: String,
    engines: EngineAvailability,
}

impl SqliteStore {
    /// Bind a migrated pool to `scope`. `fts` comes from the migration
    /// report; the vector table is probed here.
    pub async fn open(pool: SqlitePool, scope: &TenantScope, fts: Availability) -> Result<Self> {
        let vector = match sqlx::query("SELECT chunk_id FROM memory_chunk_vectors LIMIT 1")
            .fetch_optional(&pool)
            .await
        {
            Ok(_) => Availability::Ready,
            Err(e) => Availability::Unavailable(format!("vector table unavailable: {}", e)),
        };
        Ok(Self {
            pool,
            scope: scope.key(),
            engines: EngineAvailability {
                lexical: fts,
                vector,
            },
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn source_list(sources: &[Source]) -> String {
    sources
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_source(value: &str) -> Source {
    Source::parse(value).unwrap_or(Source::Memory)
}

/// Quote each term for FTS5 and AND them together.
fn fts_match_expr(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delete chunk rows, their FTS rows, then their vectors.
async fn delete_chunks(conn: &mut SqliteConnection, ids: &[String], fts: bool) -> Result<usize> {
    for id in ids {
        if fts {
            sqlx::query("DELETE FROM memory_chunks_fts WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query("DELETE FROM memory_chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    for id in ids {
        sqlx::query("DELETE FROM memory_chunk_vectors WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(ids.len())
}

#[async_trait]
impl Store for SqliteStore {
    fn engines(&self) -> EngineAvailability {
        self.engines.clone()
    }

    async fn read_meta(&self) -> Result<Option<IndexMeta>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT meta_json FROM memory_meta WHERE scope = ?")
                .bind(&self.scope)
                .fetch_optional(&self.pool)
                .await?;
        match raw.flatten() {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Corrupt index meta")?,
            )),
            None => Ok(None),
        }
    }

    async fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        sqlx::query(
            r#"
            INSERT INTO memory_meta (scope, meta_json) VALUES (?, ?)
            ON CONFLICT(scope) DO UPDATE SET meta_json = excluded.meta_json
            "#,
        )
        .bind(&self.scope)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_generation(&self) -> Result<i64> {
        let generation: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO memory_meta (scope, generation) VALUES (?, 1)
            ON CONFLICT(scope) DO UPDATE SET generation = generation + 1
            RETURNING generation
            "#,
        )
        .bind(&self.scope)
        .fetch_one(&self.pool)
        .await?;
        Ok(generation)
    }

    async fn list_files(&self) -> Result<Vec<IndexedFile>> {
        let rows = sqlx::query(
            "SELECT path, source, hash, generation, indexed_at FROM memory_files WHERE scope = ? ORDER BY path",
        )
        .bind(&self.scope)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexedFile {
                path: row.get("path"),
                source: parse_source(row.get::<&str, _>("source")),
                hash: row.get("hash"),
                generation: row.get("generation"),
                indexed_at: row.get("indexed_at"),
            })
            .collect())
    }

    async fn commit(&self, batch: &IndexBatch) -> Result<CommitSummary> {
        let fts = self.engines.lexical.is_ready();
        let mut summary = CommitSummary::default();
        let mut tx = self.pool.begin().await?;

        // New generation first.
        for doc in &batch.documents {
            for chunk in &doc.chunks {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO memory_chunks
                        (id, scope, path, source, start_line, end_line, text, hash, generation)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&chunk.id)
                .bind(&self.scope)
                .bind(&chunk.path)
                .bind(chunk.source.as_str())
                .bind(chunk.start_line as i64)
                .bind(chunk.end_line as i64)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .bind(chunk.generation)
                .execute(&mut *tx)
                .await?;

                if fts {
                    sqlx::query("INSERT INTO memory_chunks_fts (text, id, scope) VALUES (?, ?, ?)")
                        .bind(&chunk.text)
                        .bind(&chunk.id)
                        .bind(&self.scope)
                        .execute(&mut *tx)
                        .await?;
                }

                if let Some(embedding) = &chunk.embedding {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO memory_chunk_vectors (chunk_id, scope, dims, embedding)
                        VALUES (?, ?, ?, ?)
                        "#,
                    )
                    .bind(&chunk.id)
                    .bind(&self.scope)
                    .bind(embedding.len() as i64)
                    .bind(vec_to_blob(embedding))
                    .execute(&mut *tx)
                    .await?;
                }
            }
            summary.chunks_written += doc.chunks.len();
            summary.documents += 1;
        }

        // Then the older generations of the same documents.
        for doc in &batch.documents {
            let old_ids: Vec<String> = sqlx::query_scalar(
                "SELECT id FROM memory_chunks WHERE scope = ? AND path = ? AND generation < ?",
            )
            .bind(&self.scope)
            .bind(&doc.file.path)
            .bind(batch.generation)
            .fetch_all(&mut *tx)
            .await?;
            summary.chunks_deleted += delete_chunks(&mut *tx, &old_ids, fts).await?;

            sqlx::query(
                r#"
                INSERT INTO memory_files (scope, path, source, hash, generation, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(scope, path) DO UPDATE SET
                    source = excluded.source,
                    hash = excluded.hash,
                    generation = excluded.generation,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(&self.scope)
            .bind(&doc.file.path)
            .bind(doc.file.source.as_str())
            .bind(&doc.file.hash)
            .bind(doc.file.generation)
            .bind(doc.file.indexed_at)
            .execute(&mut *tx)
            .await?;
        }

        for path in &batch.removed_paths {
            let ids: Vec<String> =
                sqlx::query_scalar("SELECT id FROM memory_chunks WHERE scope = ? AND path = ?")
                    .bind(&self.scope)
                    .bind(path)
                    .fetch_all(&mut *tx)
                    .await?;
            summary.chunks_deleted += delete_chunks(&mut *tx, &ids, fts).await?;

            let removed = sqlx::query("DELETE FROM memory_files WHERE scope = ? AND path = ?")
                .bind(&self.scope)
                .bind(path)
                .execute(&mut *tx)
                .await?;
            summary.paths_removed += removed.rows_affected() as usize;
        }

        for key in &batch.removed_sessions {
            sqlx::query("DELETE FROM memory_session_records WHERE scope = ? AND session_key = ?")
                .bind(&self.scope)
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn keyword_search(
        &self,
        terms: &[String],
        limit: usize,
        sources: &[Source],
    ) -> Result<Vec<ChunkCandidate>> {
        if terms.is_empty() || limit == 0 || sources.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT c.id, c.path, c.source, c.start_line, c.end_line,
                   bm25(memory_chunks_fts) AS bm25_score,
                   snippet(memory_chunks_fts, 0, '', '', '…', 48) AS snippet
            FROM memory_chunks_fts
            JOIN memory_chunks c ON c.id = memory_chunks_fts.id
            WHERE memory_chunks_fts MATCH ?
              AND memory_chunks_fts.scope = ?
              AND c.source IN ({})
            ORDER BY bm25_score
            LIMIT ?
            "#,
            source_list(sources)
        );

        let rows = sqlx::query(&sql)
            .bind(fts_match_expr(terms))
            .bind(&self.scope)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkCandidate {
                chunk_id: row.get("id"),
                path: row.get("path"),
                source: parse_source(row.get::<&str, _>("source")),
                start_line: row.get::<i64, _>("start_line") as usize,
                end_line: row.get::<i64, _>("end_line") as usize,
                raw_score: row.get("bm25_score"),
                snippet: row.get("snippet"),
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        sources: &[Source],
    ) -> Result<Vec<ChunkCandidate>> {
        if limit == 0 || sources.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, v.embedding
            FROM memory_chunk_vectors v
            JOIN memory_chunks c ON c.id = v.chunk_id
            WHERE v.scope = ? AND c.source IN ({})
            "#,
            source_list(sources)
        );

        let rows = sqlx::query(&sql)
            .bind(&self.scope)
            .fetch_all(&self.pool)
            .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let text: String = row.get("text");
                ChunkCandidate {
                    chunk_id: row.get("id"),
                    path: row.get("path"),
                    source: parse_source(row.get::<&str, _>("source")),
                    start_line: row.get::<i64, _>("start_line") as usize,
                    end_line: row.get::<i64, _>("end_line") as usize,
                    raw_score: cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64,
                    snippet: text.chars().take(SNIPPET_CHARS).collect(),
                }
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
        let mut out = Vec::with_capacity(Source::ALL.len());
        for source in Source::ALL {
            let files: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM memory_files WHERE scope = ? AND source = ?")
                    .bind(&self.scope)
                    .bind(source.as_str())
                    .fetch_one(&self.pool)
                    .await?;
            let chunks: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM memory_chunks WHERE scope = ? AND source = ?",
            )
            .bind(&self.scope)
            .bind(source.as_str())
            .fetch_one(&self.pool)
            .await?;
            out.push(SourceCounts {
                source: source.as_str().to_string(),
                files: files as u64,
                chunks: chunks as u64,
            });
        }
        Ok(out)
    }

    async fn list_session_records(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT session_key, path, updated_at, pending_bytes, pending_messages, indexed_at
            FROM memory_session_records WHERE scope = ? ORDER BY session_key
            "#,
        )
        .bind(&self.scope)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn get_session_record(&self, session_key: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT session_key, path, updated_at, pending_bytes, pending_messages, indexed_at
            FROM memory_session_records WHERE scope = ? AND session_key = ?
            "#,
        )
        .bind(&self.scope)
        .bind(session_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn upsert_session_record(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_session_records
                (scope, session_key, path, updated_at, pending_bytes, pending_messages, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope, session_key) DO UPDATE SET
                path = excluded.path,
                updated_at = excluded.updated_at,
                pending_bytes = excluded.pending_bytes,
                pending_messages = excluded.pending_messages,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&self.scope)
        .bind(&record.session_key)
        .bind(&record.path)
        .bind(record.updated_at)
        .bind(record.pending_bytes as i64)
        .bind(record.pending_messages as i64)
        .bind(record.indexed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cache_get(
        &self,
        provider_key: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut hits = HashMap::new();
        for group in hashes.chunks(CACHE_LOOKUP_GROUP) {
            let placeholders = vec!["?"; group.len()].join(",");
            let sql = format!(
                "SELECT hash, embedding FROM memory_embedding_cache \
                 WHERE scope = ? AND provider_key = ? AND hash IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(&self.scope).bind(provider_key);
            for hash in group {
                query = query.bind(hash);
            }
            for row in query.fetch_all(&self.pool).await? {
                let blob: Vec<u8> = row.get("embedding");
                hits.insert(row.get::<String, _>("hash"), blob_to_vec(&blob));
            }
        }
        Ok(hits)
    }

    async fn cache_put(&self, provider_key: &str, entries: &[(String, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = now_millis();
        for (hash, vector) in entries {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO memory_embedding_cache
                    (scope, provider_key, hash, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&self.scope)
            .bind(provider_key)
            .bind(hash)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cache_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM memory_embedding_cache WHERE scope = ?")
                .bind(&self.scope)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn cache_prune(&self, max_entries: usize) -> Result<u64> {
        let count = self.cache_count().await?;
        let excess = count.saturating_sub(max_entries as u64);
        if excess == 0 {
            return Ok(0);
        }
        // Replaced rows get a fresh rowid, so rowid breaks ties in write order.
        let result = sqlx::query(
            r#"
            DELETE FROM memory_embedding_cache WHERE rowid IN (
                SELECT rowid FROM memory_embedding_cache
                WHERE scope = ?
                ORDER BY updated_at ASC, rowid ASC
                LIMIT ?
            )
            "#,
        )
        .bind(&self.scope)
        .bind(excess as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> SessionRecord {
    SessionRecord {
        session_key: row.get("session_key"),
        path: row.get("path"),
        updated_at: row.get("updated_at"),
        pending_bytes: row.get::<i64, _>("pending_bytes").max(0) as u64,
        pending_messages: row.get::<i64, _>("pending_messages").max(0) as u64,
        indexed_at: row.get("indexed_at"),
    }
}
