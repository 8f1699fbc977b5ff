//! Core data models shared by the store, sync, and search layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the tenant that owns a memory index.
///
/// Every document, chunk, cache entry and session record is partitioned
/// by this triple; two scopes never see each other's data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub bridge_id: String,
    pub login_id: String,
    pub agent_id: String,
}

impl TenantScope {
    pub fn new(
        bridge_id: impl Into<String>,
        login_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            login_id: login_id.into(),
            agent_id: agent_id.into(),
        }
    }

    /// Storage key, `bridge/login/agent`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.bridge_id, self.login_id, self.agent_id)
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Where an indexed document comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Persistent markdown notes.
    Memory,
    /// Session transcripts.
    Sessions,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Memory, Source::Sessions];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Memory => "memory",
            Source::Sessions => "sessions",
        }
    }

    pub fn parse(value: &str) -> Option<Source> {
        match value {
            "memory" => Some(Source::Memory),
            "sessions" => Some(Source::Sessions),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk as stored in the index.
///
/// Chunks are immutable: a re-index writes new rows under a fresh
/// `generation` and the old rows are removed in the same commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub source: Source,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
    /// SHA-256 of `text`; also the embedding cache key.
    pub hash: String,
    pub generation: i64,
    pub embedding: Option<Vec<f32>>,
}

/// What the index currently holds for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedFile {
    pub path: String,
    pub source: Source,
    pub hash: String,
    pub generation: i64,
    pub indexed_at: i64,
}

/// Settings the index was built with. A mismatch forces a full re-index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub provider_key: Option<String>,
    pub model: Option<String>,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    pub vector_dims: Option<usize>,
}

/// Per-session bookkeeping for delta-triggered indexing and retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_key: String,
    pub path: String,
    /// Unix seconds of the last transcript activity.
    pub updated_at: i64,
    /// Bytes appended since the last successful index of this session.
    pub pending_bytes: u64,
    /// Messages appended since the last successful index of this session.
    pub pending_messages: u64,
    pub indexed_at: Option<i64>,
}

impl SessionRecord {
    pub fn new(session_key: &str, path: &str, updated_at: i64) -> Self {
        Self {
            session_key: session_key.to_string(),
            path: path.to_string(),
            updated_at,
            pending_bytes: 0,
            pending_messages: 0,
            indexed_at: None,
        }
    }

    /// True once either accumulated delta reaches its threshold.
    /// A zero threshold means any pending change counts.
    pub fn delta_reached(&self, delta_bytes: u64, delta_messages: u64) -> bool {
        let pending = self.pending_bytes > 0 || self.pending_messages > 0;
        if !pending {
            return false;
        }
        (delta_bytes == 0 || self.pending_bytes >= delta_bytes)
            || (delta_messages == 0 || self.pending_messages >= delta_messages)
    }
}

/// File and chunk totals for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub source: String,
    pub files: u64,
    pub chunks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key() {
        let scope = TenantScope::new("matrix", "@alice:hs", "default");
        assert_eq!(scope.key(), "matrix/@alice:hs/default");
        assert_eq!(scope.to_string(), scope.key());
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(Source::parse("memory"), Some(Source::Memory));
        assert_eq!(Source::parse("sessions"), Some(Source::Sessions));
        assert_eq!(Source::parse("notes"), None);
    }

    #[test]
    fn test_delta_thresholds() {
        let mut rec = SessionRecord::new("s1", "sessions/s1.md", 0);
        assert!(!rec.delta_reached(100, 10));
        rec.pending_bytes = 50;
        rec.pending_messages = 3;
        assert!(!rec.delta_reached(100, 10));
        rec.pending_messages = 10;
        assert!(rec.delta_reached(100, 10));
        rec.pending_messages = 0;
        rec.pending_bytes = 1;
        assert!(rec.delta_reached(0, 10));
    }
}
