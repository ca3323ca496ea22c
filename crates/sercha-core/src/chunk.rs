//! Fixed-size text chunker with overlap.
//!
//! Splits document content into [`Chunk`]s of at most `chunk_size`
//! characters, each starting `overlap` characters before the previous one
//! ended. Cut points are pulled back to the nearest paragraph break, line
//! break or space inside the window so that words are not split, and are
//! always valid UTF-8 boundaries.
//!
//! Chunk ids are derived from (document id, position), so re-chunking the
//! same content yields the same ids.
//!
//! ```rust
//! use sercha_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", 1000, 200);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position, 0);
//! ```

use crate::models::{derive_id, Chunk, Metadata};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Split `text` into overlapping chunks.
///
/// # Guarantees
///
/// - Empty or whitespace-only text produces no chunks.
/// - Positions are contiguous: `0, 1, …, N-1`.
/// - Every chunk holds at most `chunk_size` characters.
/// - An `overlap >= chunk_size` is clamped to `chunk_size / 4`.
pub fn chunk_text(document_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = if overlap >= chunk_size {
        chunk_size / 4
    } else {
        overlap
    };

    let mut chunks = Vec::new();
    if text.trim().is_empty() {
        return chunks;
    }

    let mut start = 0;
    while start < text.len() {
        let window_end = advance_chars(text, start, chunk_size);
        let end = if window_end < text.len() {
            let min_cut = advance_chars(text, start, overlap + 1);
            soft_cut(text, min_cut, window_end)
        } else {
            window_end
        };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(document_id, chunks.len(), piece));
        }
        if end >= text.len() {
            break;
        }

        let next = align_to_word(text, retreat_chars(text, end, overlap), end);
        start = if next > start { next } else { end };
    }

    chunks
}

/// Pull `window_end` back to the last break after `min_cut`, preferring
/// paragraph breaks, then line breaks, then spaces.
fn soft_cut(text: &str, min_cut: usize, window_end: usize) -> usize {
    if min_cut >= window_end {
        return window_end;
    }
    let window = &text[min_cut..window_end];
    window
        .rfind("\n\n")
        .map(|pos| pos + 2)
        .or_else(|| window.rfind('\n').map(|pos| pos + 1))
        .or_else(|| window.rfind(' ').map(|pos| pos + 1))
        .map(|pos| min_cut + pos)
        .unwrap_or(window_end)
}

/// Move a mid-word `index` forward to the start of the next word, without
/// passing `limit`.
fn align_to_word(text: &str, index: usize, limit: usize) -> usize {
    if index == 0 || text[..index].ends_with([' ', '\n']) {
        return index;
    }
    text[index..limit]
        .find([' ', '\n'])
        .map(|pos| index + pos + 1)
        .unwrap_or(index)
}

/// Byte index `n` characters after `from`, clamped to the end of `s`.
fn advance_chars(s: &str, from: usize, n: usize) -> usize {
    s[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(s.len())
}

/// Byte index `n` characters before `from`, clamped to 0.
fn retreat_chars(s: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    s[..from]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn make_chunk(document_id: &str, position: usize, text: &str) -> Chunk {
    Chunk {
        id: chunk_id(document_id, position),
        document_id: document_id.to_string(),
        content: text.to_string(),
        position,
        embedding: None,
        metadata: Metadata::new(),
    }
}

/// Stable chunk id for (document, position).
pub fn chunk_id(document_id: &str, position: usize) -> String {
    derive_id(&[document_id, &position.to_string()])
}
