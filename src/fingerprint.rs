//! Content fingerprints and text normalization.
//!
//! All fingerprints are lowercase hex SHA-256. File fingerprints cover the
//! raw bytes; chunk fingerprints cover whitespace-normalized text so that
//! re-flowed copies of the same passage collide; exchange keys cover the
//! normalized query and response of a conversation turn.

use sha2::{Digest, Sha256};

/// Characters stripped from exchanges before keying (markdown emphasis,
/// code, quotes, headings, rules, escapes).
const MARKDOWN_SYMBOLS: &[char] = &['*', '_', '`', '~', '#', '>', '\\', '-'];

/// Punctuation that absorbs preceding whitespace during normalization.
const TIGHT_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of a file's full byte content.
pub fn file_fingerprint(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

/// Collapse all whitespace runs to one space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fingerprint of a chunk's normalized text.
pub fn chunk_fingerprint(text: &str) -> String {
    sha256_hex(normalize_whitespace(text).as_bytes())
}

/// Cut a trailing `Source:`/`Sources:` section (any case) and trim.
pub fn strip_sources_section(text: &str) -> &str {
    let lower = text.to_ascii_lowercase();
    let cut = lower.match_indices("source").find_map(|(i, m)| {
        let rest = &lower[i + m.len()..];
        let rest = rest.strip_prefix('s').unwrap_or(rest);
        rest.starts_with(':').then_some(i)
    });
    match cut {
        Some(i) => text[..i].trim(),
        None => text.trim(),
    }
}

/// Normalize a query or response for duplicate detection.
///
/// Strips markdown symbols, turns newlines and tabs into spaces, drops
/// whitespace before punctuation, collapses whitespace, and lowercases.
pub fn normalize_exchange_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars().filter(|c| !MARKDOWN_SYMBOLS.contains(c)) {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() && !TIGHT_PUNCTUATION.contains(&c) {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }
    out.to_lowercase()
}

/// Dedup key of a conversation turn; inputs must already be normalized.
pub fn exchange_key(normalized_query: &str, normalized_response: &str) -> String {
    sha256_hex(format!("{}|||{}", normalized_query, normalized_response).as_bytes())
}
