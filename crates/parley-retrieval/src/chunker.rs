//! Splitting attached documents into overlapping chunks.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use parley_core::config::RetrievalConfig;

/// Chunk size and overlap, both in characters. The overlap never exceeds
/// half the size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub size: usize,
    pub overlap: usize,
}

impl ChunkPlan {
    /// Size the chunks from the model's context window.
    pub fn for_context(context_size: u32, config: &RetrievalConfig) -> Self {
        let size = (context_size / config.chunk_size_divider.max(1)).max(1) as usize;
        let overlap = (context_size / config.chunk_overlap_divider.max(1)) as usize;
        Self {
            size,
            overlap: overlap.min(size / 2),
        }
    }
}

/// A chunk read from one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub source: PathBuf,
    pub chunk_index: usize,
    pub text: String,
}

/// Whether `path` has one of the allowed extensions (case-insensitive).
pub fn is_allowed(path: &Path, allowed_extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Split `text` into chunks of at most `plan.size` characters.
///
/// Each chunk prefers to end on a paragraph break, then a line break, then a
/// space, as long as that keeps it at least half full. Consecutive chunks
/// share `plan.overlap` characters, capped at half the chunk size.
pub fn split_text(text: &str, plan: ChunkPlan) -> Vec<String> {
    // Byte offset of every char boundary, including the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = bounds.len() - 1;
    let size = plan.size.max(1);
    let overlap = plan.overlap.min(size / 2);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < char_len {
        let mut end = (start + size).min(char_len);
        if end < char_len {
            end = preferred_break(text, &bounds, start, end).unwrap_or(end);
        }

        let chunk = text[bounds[start]..bounds[end]].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        if end >= char_len {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

fn preferred_break(text: &str, bounds: &[usize], start: usize, end: usize) -> Option<usize> {
    let min_end = start + (end - start) / 2;
    let window = &text[bounds[start]..bounds[end]];
    for separator in ["\n\n", "\n", " "] {
        if let Some(byte_pos) = window.rfind(separator) {
            let absolute = bounds[start] + byte_pos + separator.len();
            // Separators are ASCII, so `absolute` is a char boundary.
            if let Ok(char_pos) = bounds.binary_search(&absolute) {
                if char_pos > min_end {
                    return Some(char_pos);
                }
            }
        }
    }
    None
}

/// Read and chunk every allowed file in `paths`.
///
/// Unreadable files are skipped with a warning. Returns the chunks and the
/// list of files that contributed at least one chunk.
pub fn load_documents(
    paths: &[PathBuf],
    allowed_extensions: &[String],
    plan: ChunkPlan,
) -> (Vec<DocumentChunk>, Vec<PathBuf>) {
    let mut chunks = Vec::new();
    let mut indexed = Vec::new();

    for path in paths {
        if !is_allowed(path, allowed_extensions) {
            debug!(path = %path.display(), "Skipping file with unsupported extension");
            continue;
        }
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read attachment");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let pieces = split_text(&text, plan);
        if pieces.is_empty() {
            continue;
        }
        indexed.push(path.clone());
        chunks.extend(
            pieces
                .into_iter()
                .enumerate()
                .map(|(chunk_index, text)| DocumentChunk {
                    source: path.clone(),
                    chunk_index,
                    text,
                }),
        );
    }
    (chunks, indexed)
}
