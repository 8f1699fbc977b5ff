//! Path normalization and the rules deciding which documents are indexable.
//!
//! Notes live at `MEMORY.md`, `memory.md` or under `memory/`; operators can
//! add more locations through extra-path entries (a glob, a `.md` file, or
//! a directory prefix). Session transcripts live under `sessions/`.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::PathError;
use crate::models::Source;

pub const SESSIONS_PREFIX: &str = "sessions/";

/// Normalize a caller-supplied relative path.
///
/// Backslashes become slashes, `.` and empty segments are dropped, and
/// absolute paths or `..` segments are rejected.
pub fn normalize_path(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    let unified = trimmed.replace('\\', "/");
    if unified.starts_with('/') || unified.chars().nth(1) == Some(':') {
        return Err(PathError::Absolute(raw.to_string()));
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(raw.to_string())),
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Built-in note locations.
pub fn is_memory_note(path: &str) -> bool {
    path == "MEMORY.md"
        || path == "memory.md"
        || (path.starts_with("memory/") && path.ends_with(".md"))
}

pub fn is_session_path(path: &str) -> bool {
    path.starts_with(SESSIONS_PREFIX) && path.ends_with(".md")
}

/// Transcript path for a session key. Characters outside
/// `[A-Za-z0-9._-]` are replaced so the key maps to one path segment.
pub fn session_path(session_key: &str) -> String {
    let safe: String = session_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}.md", SESSIONS_PREFIX, safe)
}

/// Compiled indexability rules for one tenant configuration.
#[derive(Debug, Clone)]
pub struct PathRules {
    globs: GlobSet,
    files: Vec<String>,
    prefixes: Vec<String>,
    sessions_enabled: bool,
    memory_enabled: bool,
}

impl PathRules {
    pub fn new(
        extra_paths: &[String],
        memory_enabled: bool,
        sessions_enabled: bool,
    ) -> Result<Self, PathError> {
        let mut builder = GlobSetBuilder::new();
        let mut files = Vec::new();
        let mut prefixes = Vec::new();

        for raw in extra_paths {
            let is_glob = raw.contains(&['*', '?', '[', '{'][..]);
            if is_glob {
                if raw.starts_with('/') || raw.split('/').any(|p| p == "..") {
                    return Err(PathError::BadPattern {
                        pattern: raw.clone(),
                        reason: "must be relative and stay inside the memory root".into(),
                    });
                }
                let glob = Glob::new(raw).map_err(|e| PathError::BadPattern {
                    pattern: raw.clone(),
                    reason: e.to_string(),
                })?;
                builder.add(glob);
                continue;
            }

            let normalized = normalize_path(raw).map_err(|e| PathError::BadPattern {
                pattern: raw.clone(),
                reason: e.to_string(),
            })?;
            if normalized.ends_with(".md") {
                files.push(normalized);
            } else {
                prefixes.push(format!("{}/", normalized));
            }
        }

        let globs = builder.build().map_err(|e| PathError::BadPattern {
            pattern: extra_paths.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            globs,
            files,
            prefixes,
            sessions_enabled,
            memory_enabled,
        })
    }

    /// The source an already-normalized path is indexed under, or `None`
    /// when the path is not indexable.
    pub fn classify(&self, path: &str) -> Option<Source> {
        if is_session_path(path) {
            return self.sessions_enabled.then_some(Source::Sessions);
        }
        if !self.memory_enabled {
            return None;
        }
        if is_memory_note(path) || self.is_extra(path) {
            return Some(Source::Memory);
        }
        None
    }

    fn is_extra(&self, path: &str) -> bool {
        if !path.ends_with(".md") {
            return false;
        }
        self.files.iter().any(|f| f == path)
            || self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
            || self.globs.is_match(path)
    }

    /// Normalize `raw` and require it to be indexable.
    pub fn resolve(&self, raw: &str) -> Result<(String, Source), PathError> {
        let path = normalize_path(raw)?;
        match self.classify(&path) {
            Some(source) => Ok((path, source)),
            None => Err(PathError::NotIndexable(path)),
        }
    }
}
