//! Line-addressed markdown chunker with overlap.
//!
//! Splits a document into spans that stay under a token budget while
//! remembering which source lines each span covers, so search results can
//! point back to `path:start-end`.
//!
//! # Algorithm
//!
//! 1. Convert `tokens` to `max_chars` using a 4 chars/token ratio (at
//!    least 32 chars) and `overlap` to `overlap_chars` the same way.
//! 2. Walk the document line by line. Lines longer than `max_chars` are
//!    cut into `max_chars` segments that keep their line number.
//! 3. Accumulate segments until the next one would exceed `max_chars`,
//!    then flush the buffer as a chunk.
//! 4. Seed the next buffer with trailing segments totalling at most
//!    `overlap_chars`, dropping from the front if the incoming segment
//!    would still not fit.
//!
//! Output is fully determined by the input text and the two parameters.
//!
//! # Example
//!
//! ```rust
//! use bridge_memory_core::chunk::chunk_markdown;
//!
//! let spans = chunk_markdown("# Title\n\nSome notes.", 400, 80);
//! assert_eq!(spans.len(), 1);
//! assert_eq!((spans[0].start_line, spans[0].end_line), (1, 3));
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, Source};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Lower bound on chunk size in characters.
const MIN_CHUNK_CHARS: usize = 32;

/// A chunk before it is tagged with a path and generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub hash: String,
}

struct Segment<'a> {
    text: &'a str,
    line_no: usize,
    /// Characters including the joining newline.
    size: usize,
}

/// Split `content` into overlapping, line-addressed spans.
///
/// Whitespace-only content produces no spans. Each span's text is at most
/// `max(32, tokens × 4)` characters.
pub fn chunk_markdown(content: &str, tokens: usize, overlap: usize) -> Vec<ChunkSpan> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let max_chars = tokens.saturating_mul(CHARS_PER_TOKEN).max(MIN_CHUNK_CHARS);
    let overlap_chars = overlap.saturating_mul(CHARS_PER_TOKEN);

    let mut spans = Vec::new();
    let mut current: Vec<Segment<'_>> = Vec::new();
    let mut current_chars = 0usize;

    for (idx, line) in content.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        for piece in split_line(line, max_chars) {
            let size = piece.chars().count() + 1;

            if current_chars + size > max_chars && !current.is_empty() {
                spans.push(flush(&current));
                current = carry_overlap(current, overlap_chars);
                current_chars = current.iter().map(|s| s.size).sum();
                while current_chars + size > max_chars && !current.is_empty() {
                    let dropped = current.remove(0);
                    current_chars -= dropped.size;
                }
            }

            current.push(Segment {
                text: piece,
                line_no: idx + 1,
                size,
            });
            current_chars += size;
        }
    }

    if !current.is_empty() {
        spans.push(flush(&current));
    }

    spans
}

/// Cut a line into `max_chars`-sized pieces on char boundaries.
fn split_line(line: &str, max_chars: usize) -> Vec<&str> {
    if line.is_empty() {
        return vec![""];
    }
    let mut pieces = Vec::new();
    let mut start = 0usize;
    let mut count = 0usize;
    for (byte_idx, _) in line.char_indices() {
        if count == max_chars {
            pieces.push(&line[start..byte_idx]);
            start = byte_idx;
            count = 0;
        }
        count += 1;
    }
    pieces.push(&line[start..]);
    pieces
}

fn flush(segments: &[Segment<'_>]) -> ChunkSpan {
    let text = segments
        .iter()
        .map(|s| s.text)
        .collect::<Vec<_>>()
        .join("\n");
    let start_line = segments.first().map(|s| s.line_no).unwrap_or(1);
    let end_line = segments.last().map(|s| s.line_no).unwrap_or(start_line);
    ChunkSpan {
        start_line,
        end_line,
        hash: hash_text(&text),
        text,
    }
}

fn carry_overlap(segments: Vec<Segment<'_>>, overlap_chars: usize) -> Vec<Segment<'_>> {
    if overlap_chars == 0 {
        return Vec::new();
    }
    let mut acc = 0usize;
    let mut keep_from = segments.len();
    for (i, seg) in segments.iter().enumerate().rev() {
        if acc + seg.size > overlap_chars {
            break;
        }
        acc += seg.size;
        keep_from = i;
    }
    segments.into_iter().skip(keep_from).collect()
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable chunk id for a span written under `generation`.
pub fn chunk_id(source: Source, path: &str, span: &ChunkSpan, generation: i64) -> String {
    hash_text(&format!(
        "{}:{}:{}:{}:{}:{}",
        source.as_str(),
        path,
        span.start_line,
        span.end_line,
        span.hash,
        generation
    ))
}

/// Chunk a document and tag the spans for storage.
pub fn chunk_document(
    path: &str,
    source: Source,
    content: &str,
    tokens: usize,
    overlap: usize,
    generation: i64,
) -> Vec<Chunk> {
    chunk_markdown(content, tokens, overlap)
        .into_iter()
        .map(|span| Chunk {
            id: chunk_id(source, path, &span, generation),
            path: path.to_string(),
            source,
            start_line: span.start_line,
            end_line: span.end_line,
            text: span.text,
            hash: span.hash,
            generation,
            embedding: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_lines(n: usize, width: usize) -> String {
        (1..=n)
            .map(|i| format!("{:0width$}", i, width = width))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_empty_and_blank() {
        assert!(chunk_markdown("", 400, 80).is_empty());
        assert!(chunk_markdown("  \n\n\t", 400, 80).is_empty());
    }

    #[test]
    fn test_single_small_document() {
        let spans = chunk_markdown("a\nb\nc", 400, 80);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "a\nb\nc");
        assert_eq!(spans[0].start_line, 1);
        assert_eq!(spans[0].end_line, 3);
        assert_eq!(spans[0].hash, hash_text("a\nb\nc"));
    }

    #[test]
    fn test_chunks_respect_budget() {
        // 200 lines of 9 chars (+1 newline) = 2000 chars; budget 40 chars.
        let text = numbered_lines(200, 9);
        let spans = chunk_markdown(&text, 10, 2);
        assert!(spans.len() > 1);
        for span in &spans {
            assert!(span.text.chars().count() <= 40, "span too long: {}", span.text.len());
            assert!(span.start_line <= span.end_line);
        }
        assert_eq!(spans.first().unwrap().start_line, 1);
        assert_eq!(spans.last().unwrap().end_line, 200);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let text = numbered_lines(50, 9);
        let spans = chunk_markdown(&text, 10, 5);
        for pair in spans.windows(2) {
            assert!(
                pair[1].start_line <= pair[0].end_line,
                "expected overlap between {:?} and {:?}",
                (pair[0].start_line, pair[0].end_line),
                (pair[1].start_line, pair[1].end_line)
            );
        }
    }

    #[test]
    fn test_no_overlap_is_contiguous() {
        let text = numbered_lines(50, 9);
        let spans = chunk_markdown(&text, 10, 0);
        for pair in spans.windows(2) {
            assert_eq!(pair[1].start_line, pair[0].end_line + 1);
        }
    }

    #[test]
    fn test_long_line_split_keeps_line_number() {
        let long = "x".repeat(100);
        let text = format!("head\n{}\ntail", long);
        let spans = chunk_markdown(&text, 8, 0);
        assert!(spans.iter().all(|s| s.text.chars().count() <= 32));
        let covering: Vec<_> = spans.iter().filter(|s| s.text.contains('x')).collect();
        assert!(covering.len() >= 3);
        assert!(covering.iter().all(|s| s.start_line <= 2 && s.end_line >= 2));
    }

    #[test]
    fn test_multibyte_lines_do_not_panic() {
        let line = "ü".repeat(90);
        let spans = chunk_markdown(&line, 8, 2);
        assert!(!spans.is_empty());
        let total: usize = spans.iter().map(|s| s.text.chars().count()).sum();
        assert!(total >= 90);
    }

    #[test]
    fn test_huge_budget_is_one_chunk() {
        let spans = chunk_markdown("a\nb", usize::MAX, usize::MAX);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].end_line, 2);
    }

    #[test]
    fn test_deterministic() {
        let text = numbered_lines(120, 7);
        let a = chunk_markdown(&text, 12, 3);
        let b = chunk_markdown(&text, 12, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_ids_depend_on_generation() {
        let a = chunk_document("memory/a.md", Source::Memory, "hello", 400, 80, 1);
        let b = chunk_document("memory/a.md", Source::Memory, "hello", 400, 80, 2);
        assert_eq!(a.len(), 1);
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].hash, b[0].hash);
        assert_eq!(b[0].generation, 2);
    }
}
