//! Sliding-window text chunker with overlap.
//!
//! Splits a document into fixed-size character windows where consecutive
//! windows share `overlap` characters. Chunk content is always a verbatim
//! substring of the input: no trimming, no whitespace normalization and no
//! deduplication.
//!
//! # Algorithm
//!
//! 1. Validate `chunk_size > 0` and `overlap < chunk_size` before any work.
//! 2. Start a cursor at character 0.
//! 3. Emit `[cursor, min(cursor + chunk_size, len))`.
//! 4. Stop once the emitted window reached the end of the text, otherwise
//!    advance the cursor by `chunk_size - overlap` and repeat.
//!
//! The advance step is clamped to at least one character, so the loop
//! terminates even if the validation in step 1 were bypassed.
//!
//! Offsets and lengths count Unicode scalar values, so a window never cuts
//! through a multi-byte character.
//!
//! # Example
//!
//! ```rust
//! use docqa_core::chunk::split_text;
//!
//! let chunks = split_text("abcdefghij", 4, 1).unwrap();
//! assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);
//! ```

use crate::error::{PipelineError, Result};

/// A chunk together with its position in the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Position in the ordered chunk sequence.
    pub index: usize,
    /// Offset of the first character, counted in characters.
    pub char_offset: usize,
    /// Verbatim window content.
    pub text: String,
}

impl ChunkSpan {
    /// Length of the window in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Check chunking parameters without touching any text.
///
/// Used by configuration loading and by HTTP handlers to reject bad
/// parameters at the boundary.
pub fn validate_window(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(PipelineError::Configuration(
            "chunk_size must be greater than 0".to_string(),
        ));
    }
    if overlap >= chunk_size {
        return Err(PipelineError::Configuration(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// Number of windows produced for a text of `char_len` characters.
///
/// Equals `ceil((char_len - overlap) / (chunk_size - overlap))`, with a floor
/// of one chunk for texts no longer than the overlap.
pub fn expected_chunk_count(char_len: usize, chunk_size: usize, overlap: usize) -> usize {
    if char_len == 0 {
        return 0;
    }
    let step = chunk_size.saturating_sub(overlap).max(1);
    if char_len <= overlap {
        return 1;
    }
    (char_len - overlap).div_ceil(step).max(1)
}

/// Split `text` into overlapping windows.
///
/// # Errors
///
/// [`PipelineError::Configuration`] if `text` is empty, `chunk_size` is 0 or
/// `overlap >= chunk_size`. No chunk is computed in that case.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    Ok(split_spans(text, chunk_size, overlap)?
        .into_iter()
        .map(|span| span.text)
        .collect())
}

/// Like [`split_text`], but keeps each window's index and character offset.
pub fn split_spans(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<ChunkSpan>> {
    validate_window(chunk_size, overlap)?;
    if text.is_empty() {
        return Err(PipelineError::Configuration(
            "text must not be empty".to_string(),
        ));
    }

    // Byte offset of every character plus the end of the string, so that
    // `bounds[c]` is the byte position of character `c`.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = bounds.len() - 1;
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut spans = Vec::with_capacity(expected_chunk_count(char_len, chunk_size, overlap));
    let mut cursor = 0usize;
    loop {
        let end = cursor.saturating_add(chunk_size).min(char_len);
        spans.push(ChunkSpan {
            index: spans.len(),
            char_offset: cursor,
            text: text[bounds[cursor]..bounds[end]].to_string(),
        });
        if end == char_len {
            break;
        }
        cursor += step;
    }

    tracing::debug!(
        chunks = spans.len(),
        chars = char_len,
        chunk_size,
        overlap,
        "split text into chunks"
    );
    Ok(spans)
}
