//! Staged index changes committed as one unit.

use anyhow::Result;

use super::Store;
use crate::models::{Chunk, IndexedFile};

/// A document re-chunked under the batch generation.
#[derive(Debug, Clone)]
pub struct StagedDocument {
    pub file: IndexedFile,
    pub chunks: Vec<Chunk>,
}

/// Everything one sync or prune pass wants to change.
///
/// Nothing is visible until [`IndexBatch::commit`] succeeds, and a failed
/// commit leaves the previous generation untouched.
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    pub generation: i64,
    pub documents: Vec<StagedDocument>,
    /// Paths whose chunks, vectors and file rows are dropped entirely.
    pub removed_paths: Vec<String>,
    /// Session records deleted alongside their transcripts' index rows.
    pub removed_sessions: Vec<String>,
}

/// What a commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub documents: usize,
    pub chunks_written: usize,
    pub chunks_deleted: usize,
    pub paths_removed: usize,
}

impl IndexBatch {
    pub fn new(generation: i64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn stage_document(&mut self, file: IndexedFile, chunks: Vec<Chunk>) {
        self.documents.push(StagedDocument { file, chunks });
    }

    pub fn stage_removal(&mut self, path: impl Into<String>) {
        self.removed_paths.push(path.into());
    }

    pub fn stage_session_removal(&mut self, session_key: impl Into<String>, path: impl Into<String>) {
        self.removed_sessions.push(session_key.into());
        self.removed_paths.push(path.into());
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.removed_paths.is_empty() && self.removed_sessions.is_empty()
    }

    /// Apply the batch to `store`. Empty batches are a no-op.
    pub async fn commit(&self, store: &dyn Store) -> Result<CommitSummary> {
        if self.is_empty() {
            return Ok(CommitSummary::default());
        }
        store.commit(self).await
    }
}
