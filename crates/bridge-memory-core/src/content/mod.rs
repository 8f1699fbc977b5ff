//! Tenant-scoped virtual file store for notes and session transcripts.
//!
//! The content store owns document bytes. The sync engine only reads from
//! it: it lists entries with their hash and modification time to find
//! stale documents, then reads the stale ones in full.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::Source;

/// Metadata for one stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentMeta {
    pub path: String,
    pub source: Source,
    pub hash: String,
    /// Unix seconds.
    pub updated_at: i64,
    pub size: u64,
}

/// A stored document with its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentEntry {
    pub meta: ContentMeta,
    pub content: String,
}

/// Source for a normalized path in the content store.
pub fn source_for_path(path: &str) -> Source {
    if crate::paths::is_session_path(path) {
        Source::Sessions
    } else {
        Source::Memory
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Create or overwrite a document.
    async fn write(&self, path: &str, content: &str) -> Result<ContentMeta>;

    /// Append to a document, creating it when missing.
    async fn append(&self, path: &str, content: &str) -> Result<ContentMeta>;

    async fn read(&self, path: &str) -> Result<Option<ContentEntry>>;

    /// Returns whether a document was removed.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// All documents, ordered by path.
    async fn list(&self) -> Result<Vec<ContentMeta>>;
}
