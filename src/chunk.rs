//! Paragraph-boundary text chunker.
//!
//! Documents are split into chunks that fit a `max_tokens` budget using the
//! same 4-chars-per-token estimate the retriever uses for its context
//! budget, so a stored chunk and a budgeted chunk agree on size.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio used throughout the pipeline.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of a text, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// SHA-256 hex digest of a text, used for staleness/dedup detection.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split document body text into chunks on paragraph boundaries.
///
/// Paragraphs are packed greedily; a single paragraph larger than the
/// budget is split on sentence boundaries, then hard-split as a last
/// resort. Always returns at least one chunk, and indices are contiguous
/// from 0.
pub fn chunk_text(document_id: &str, title: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut buffer = String::new();

    for para in text.replace('\r', "").split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let joined_len = if buffer.is_empty() {
            para.len()
        } else {
            buffer.len() + 2 + para.len()
        };

        if joined_len > max_chars && !buffer.is_empty() {
            pieces.push(std::mem::take(&mut buffer));
        }

        if para.len() > max_chars {
            if !buffer.is_empty() {
                pieces.push(std::mem::take(&mut buffer));
            }
            pieces.extend(split_oversized(para, max_chars));
        } else {
            if !buffer.is_empty() {
                buffer.push_str("\n\n");
            }
            buffer.push_str(para);
        }
    }

    if !buffer.is_empty() {
        pieces.push(buffer);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index: index as i64,
            title: title.to_string(),
            text: piece,
        })
        .collect()
}

/// Break one oversized paragraph into budget-sized pieces, preferring
/// sentence boundaries, then whitespace, then a hard cut. All cuts land
/// on char boundaries, so multibyte text never splits mid-character.
fn split_oversized(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;

    while !rest.is_empty() {
        if rest.len() <= max_chars {
            out.push(rest.trim().to_string());
            break;
        }
        let mut end = floor_char_boundary(rest, max_chars);
        if end == 0 {
            // Budget smaller than the first char: take it anyway so the
            // loop always advances.
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let window = &rest[..end];
        let cut = window
            .rfind(". ")
            .map(|p| p + 2)
            .or_else(|| {
                window
                    .rfind(char::is_whitespace)
                    .map(|p| p + window[p..].chars().next().map_or(1, char::len_utf8))
            })
            .unwrap_or(window.len());
        out.push(rest[..cut].trim().to_string());
        rest = &rest[cut..];
    }

    out.retain(|p| !p.is_empty());
    out
}

/// Largest char-boundary index not past `index`.
pub(crate) fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}
