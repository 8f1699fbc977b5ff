//! Reading a memory file, or a line range of it.

use anyhow::Result;
use serde::Serialize;

use bridge_memory_core::content::ContentStore;
use bridge_memory_core::error::PathError;
use bridge_memory_core::paths::PathRules;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadFileResult {
    pub path: String,
    pub text: String,
    /// 1-based first line of `text`.
    pub from: usize,
    /// Lines returned.
    pub lines: usize,
    pub total_lines: usize,
}

/// Read `raw_path` from the content store.
///
/// The path must normalize cleanly and be indexable under `rules`;
/// otherwise a [`PathError`] is returned. `from` is 1-based; `lines`
/// caps the slice length.
pub async fn read_file(
    content: &dyn ContentStore,
    rules: &PathRules,
    raw_path: &str,
    from: Option<usize>,
    lines: Option<usize>,
) -> Result<ReadFileResult> {
    let (path, _source) = rules.resolve(raw_path)?;
    let entry = content
        .read(&path)
        .await?
        .ok_or_else(|| PathError::NotFound(path.clone()))?;

    let all: Vec<&str> = entry.content.lines().collect();
    let total_lines = all.len();

    if from.is_none() && lines.is_none() {
        return Ok(ReadFileResult {
            path,
            text: entry.content,
            from: 1,
            lines: total_lines,
            total_lines,
        });
    }

    let start = from.unwrap_or(1).max(1);
    let slice: Vec<&str> = all
        .iter()
        .skip(start - 1)
        .take(lines.unwrap_or(usize::MAX))
        .copied()
        .collect();

    Ok(ReadFileResult {
        path,
        lines: slice.len(),
        text: slice.join("\n"),
        from: start,
        total_lines,
    })
}
