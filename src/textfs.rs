//! SQLite-backed [`ContentStore`]: the tenant's virtual markdown files.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use bridge_memory_core::chunk::hash_text;
use bridge_memory_core::content::{source_for_path, ContentEntry, ContentMeta, ContentStore};
use bridge_memory_core::models::TenantScope;

pub struct SqliteContentStore {
    pool: SqlitePool,
    scope: String,
}

impl SqliteContentStore {
    pub fn new(pool: SqlitePool, scope: &TenantScope) -> Self {
        Self {
            pool,
            scope: scope.key(),
        }
    }
}

fn meta_from_row(row: &sqlx::sqlite::SqliteRow) -> ContentMeta {
    let path: String = row.get("path");
    ContentMeta {
        source: source_for_path(&path),
        path,
        hash: row.get("hash"),
        updated_at: row.get("updated_at"),
        size: row.get::<i64, _>("size").max(0) as u64,
    }
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    async fn write(&self, path: &str, content: &str) -> Result<ContentMeta> {
        let meta = ContentMeta {
            path: path.to_string(),
            source: source_for_path(path),
            hash: hash_text(content),
            updated_at: chrono::Utc::now().timestamp(),
            size: content.len() as u64,
        };
        sqlx::query(
            r#"
            INSERT INTO text_files (scope, path, source, content, hash, size, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope, path) DO UPDATE SET
                source = excluded.source,
                content = excluded.content,
                hash = excluded.hash,
                size = excluded.size,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.scope)
        .bind(&meta.path)
        .bind(meta.source.as_str())
        .bind(content)
        .bind(&meta.hash)
        .bind(meta.size as i64)
        .bind(meta.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(meta)
    }

    async fn append(&self, path: &str, content: &str) -> Result<ContentMeta> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<String> =
            sqlx::query_scalar("SELECT content FROM text_files WHERE scope = ? AND path = ?")
                .bind(&self.scope)
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?;
        let mut body = existing.unwrap_or_default();
        body.push_str(content);

        let meta = ContentMeta {
            path: path.to_string(),
            source: source_for_path(path),
            hash: hash_text(&body),
            updated_at: chrono::Utc::now().timestamp(),
            size: body.len() as u64,
        };
        sqlx::query(
            r#"
            INSERT INTO text_files (scope, path, source, content, hash, size, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope, path) DO UPDATE SET
                content = excluded.content,
                hash = excluded.hash,
                size = excluded.size,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.scope)
        .bind(&meta.path)
        .bind(meta.source.as_str())
        .bind(&body)
        .bind(&meta.hash)
        .bind(meta.size as i64)
        .bind(meta.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(meta)
    }

    async fn read(&self, path: &str) -> Result<Option<ContentEntry>> {
        let row = sqlx::query(
            "SELECT path, content, hash, size, updated_at FROM text_files WHERE scope = ? AND path = ?",
        )
        .bind(&self.scope)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ContentEntry {
            meta: meta_from_row(&row),
            content: row.get("content"),
        }))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM text_files WHERE scope = ? AND path = ?")
            .bind(&self.scope)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<ContentMeta>> {
        let rows = sqlx::query(
            "SELECT path, hash, size, updated_at FROM text_files WHERE scope = ? ORDER BY path",
        )
        .bind(&self.scope)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(meta_from_row).collect())
    }
}
