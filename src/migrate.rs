use anyhow::Result;
use bridge_memory_core::store::Availability;
use sqlx::SqlitePool;
use tracing::warn;

/// Outcome of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// Whether the FTS5 table exists. SQLite builds without FTS5 leave
    /// lexical search disabled instead of failing the migration.
    pub fts: Availability,
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<MigrationReport> {
    // Content store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS text_files (
            scope TEXT NOT NULL,
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            content TEXT NOT NULL,
            hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (scope, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-tenant index meta and generation counter
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_meta (
            scope TEXT PRIMARY KEY,
            meta_json TEXT,
            generation INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_files (
            scope TEXT NOT NULL,
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            hash TEXT NOT NULL,
            generation INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (scope, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_chunks (
            id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            generation INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_embedding_cache (
            scope TEXT NOT NULL,
            provider_key TEXT NOT NULL,
            hash TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (scope, provider_key, hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_session_records (
            scope TEXT NOT NULL,
            session_key TEXT NOT NULL,
            path TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            pending_bytes INTEGER NOT NULL DEFAULT 0,
            pending_messages INTEGER NOT NULL DEFAULT 0,
            indexed_at INTEGER,
            PRIMARY KEY (scope, session_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='memory_chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    let fts = if fts_exists {
        Availability::Ready
    } else {
        let created = sqlx::query(
            r#"
            CREATE VIRTUAL TABLE memory_chunks_fts USING fts5(
                text,
                id UNINDEXED,
                scope UNINDEXED
            )
            "#,
        )
        .execute(pool)
        .await;
        match created {
            Ok(_) => Availability::Ready,
            Err(e) => {
                warn!(error = %e, "FTS5 unavailable, lexical search disabled");
                Availability::Unavailable(format!("fts5 unavailable: {}", e))
            }
        }
    };

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memory_chunks_path ON memory_chunks(scope, path)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_source ON memory_chunks(scope, source)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_cache_updated ON memory_embedding_cache(scope, updated_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_text_files_updated ON text_files(scope, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(MigrationReport { fts })
}
