//! Adaptive sentence-aware chunker.
//!
//! Splits extracted document text into [`TextChunk`]s whose target size and
//! overlap scale with the length of the whole document. Cut points prefer
//! sentence ends (or structural hints such as CSV row starts) nearest the
//! target offset, fall back to the nearest word start, and only hard-cut
//! when the tolerance window holds neither.
//!
//! Every chunk is an exact slice of the input. Chunk `n + 1` begins with a
//! short overlap copied from the tail of chunk `n`; the rest of the chunk is
//! its *core*. Concatenating the cores in order reproduces the input.

use std::collections::{BTreeMap, HashSet};

use crate::config::ChunkingConfig;
use crate::fingerprint::chunk_fingerprint;
use crate::models::{DocumentMeta, TextChunk};

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

const TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '…'];
/// Wide terminators end a sentence without trailing whitespace.
const WIDE_TERMINATORS: &[char] = &['。', '！', '？'];
const CLOSERS: &[char] = &['"', '\'', ')', ']', '”', '’', '」', '』'];

/// Token estimate for `text`: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Chunk size and overlap picked for one document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPlan {
    /// Index into the configured size tiers.
    pub tier: usize,
    pub target_tokens: usize,
    pub overlap_ratio: f64,
}

impl ChunkPlan {
    pub fn for_document(total_tokens: usize, config: &ChunkingConfig) -> Self {
        let tier = config
            .thresholds
            .iter()
            .position(|&t| total_tokens <= t)
            .unwrap_or(config.thresholds.len());
        let size = config
            .sizes
            .get(tier)
            .or_else(|| config.sizes.last())
            .copied()
            .unwrap_or(config.max_tokens);
        let overlap = config
            .overlaps
            .get(tier)
            .or_else(|| config.overlaps.last())
            .copied()
            .unwrap_or(0.0);
        let overlap_ratio = if overlap.is_finite() {
            overlap.max(0.0).min(config.max_overlap_ratio)
        } else {
            0.0
        };

        Self {
            tier,
            target_tokens: size.max(config.min_tokens).min(config.max_tokens),
            overlap_ratio,
        }
    }

    fn target_chars(&self) -> usize {
        self.target_tokens * CHARS_PER_TOKEN
    }

    fn overlap_chars(&self) -> usize {
        (self.target_chars() as f64 * self.overlap_ratio).floor() as usize
    }
}

/// Split `text` into chunks sized for its length.
pub fn chunk_document(text: &str, meta: &DocumentMeta, config: &ChunkingConfig) -> Vec<TextChunk> {
    chunk_with_hints(text, &[], meta, config)
}

/// Like [`chunk_document`], also treating the byte offsets in `hints` as
/// sentence-grade boundaries.
pub fn chunk_with_hints(
    text: &str,
    hints: &[usize],
    meta: &DocumentMeta,
    config: &ChunkingConfig,
) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let doc = CharMap::new(text, hints);
    let total_tokens = doc.len().div_ceil(CHARS_PER_TOKEN);
    let plan = ChunkPlan::for_document(total_tokens, config);

    if total_tokens <= config.min_tokens || total_tokens <= plan.target_tokens {
        return vec![make_chunk(text, meta, 0, 0..text.len(), 0)];
    }

    let windows = Windows::new(&plan, config);
    let mut chunks = Vec::new();
    let mut core_start = 0usize;

    while core_start < doc.len() {
        let remaining = doc.len() - core_start;
        let core_end = if remaining <= windows.hi {
            doc.len()
        } else {
            doc.find_cut(
                core_start + windows.lo,
                core_start + windows.ideal,
                core_start + windows.hi,
            )
        };

        let start = if chunks.is_empty() {
            core_start
        } else {
            doc.overlap_start(core_start, windows.overlap)
        };

        chunks.push(make_chunk(
            text,
            meta,
            chunks.len(),
            doc.byte_at(start)..doc.byte_at(core_end),
            doc.byte_at(core_start),
        ));
        core_start = core_end;
    }

    chunks
}

/// Core size bounds in chars, relative to the current core start.
struct Windows {
    lo: usize,
    ideal: usize,
    hi: usize,
    overlap: usize,
}

impl Windows {
    fn new(plan: &ChunkPlan, config: &ChunkingConfig) -> Self {
        let target = plan.target_chars();
        let overlap = plan.overlap_chars();
        let tolerance = ((target as f64 * config.boundary_tolerance).floor() as usize).max(1);
        let max_chars = config.max_tokens * CHARS_PER_TOKEN;
        let min_chars = config.min_tokens * CHARS_PER_TOKEN;

        // Overlap plus core may never exceed the configured maximum.
        let budget = max_chars.saturating_sub(overlap).max(1);
        let hi = (target + tolerance).min(budget);
        let lo = target.saturating_sub(tolerance).max(min_chars).clamp(1, hi);
        let ideal = target.clamp(lo, hi);

        Self {
            lo,
            ideal,
            hi,
            overlap,
        }
    }
}

/// Char-indexed view of the document with byte offsets for slicing.
struct CharMap {
    chars: Vec<char>,
    bytes: Vec<usize>,
    total_bytes: usize,
    hinted: HashSet<usize>,
}

impl CharMap {
    fn new(text: &str, hints: &[usize]) -> Self {
        let (bytes, chars): (Vec<usize>, Vec<char>) = text.char_indices().unzip();
        let hinted = hints
            .iter()
            .filter_map(|b| bytes.binary_search(b).ok())
            .collect();
        Self {
            chars,
            bytes,
            total_bytes: text.len(),
            hinted,
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn byte_at(&self, idx: usize) -> usize {
        self.bytes.get(idx).copied().unwrap_or(self.total_bytes)
    }

    /// Whether a new sentence (or hinted unit) starts at char `p`.
    fn is_sentence_start(&self, p: usize) -> bool {
        if p == 0 || p >= self.len() || self.chars[p].is_whitespace() {
            return false;
        }
        if self.hinted.contains(&p) || WIDE_TERMINATORS.contains(&self.chars[p - 1]) {
            return true;
        }
        if !self.chars[p - 1].is_whitespace() {
            return false;
        }

        let mut q = p;
        let mut newlines = 0;
        while q > 0 && self.chars[q - 1].is_whitespace() {
            if self.chars[q - 1] == '\n' {
                newlines += 1;
            }
            q -= 1;
        }
        if newlines >= 2 {
            return true;
        }
        while q > 0 && CLOSERS.contains(&self.chars[q - 1]) {
            q -= 1;
        }
        q > 0 && TERMINATORS.contains(&self.chars[q - 1])
    }

    fn is_word_start(&self, p: usize) -> bool {
        p > 0 && p < self.len() && !self.chars[p].is_whitespace() && self.chars[p - 1].is_whitespace()
    }

    /// Cut position in `[lo, hi]` nearest `ideal`.
    fn find_cut(&self, lo: usize, ideal: usize, hi: usize) -> usize {
        let hi = hi.min(self.len());
        let lo = lo.min(hi);
        let ideal = ideal.clamp(lo, hi);
        self.nearest(lo, ideal, hi, |p| self.is_sentence_start(p))
            .or_else(|| self.nearest(lo, ideal, hi, |p| self.is_word_start(p)))
            .unwrap_or(ideal)
    }

    fn nearest(&self, lo: usize, ideal: usize, hi: usize, accept: impl Fn(usize) -> bool) -> Option<usize> {
        let reach = (ideal - lo).max(hi - ideal);
        (0..=reach).find_map(|d| {
            let before = ideal.checked_sub(d).filter(|&p| p >= lo && accept(p));
            before.or_else(|| Some(ideal + d).filter(|&p| p <= hi && accept(p)))
        })
    }

    /// Earliest clean start of an overlap of at most `overlap` chars
    /// before `core_start`.
    fn overlap_start(&self, core_start: usize, overlap: usize) -> usize {
        if overlap == 0 {
            return core_start;
        }
        let from = core_start.saturating_sub(overlap);
        (from..core_start)
            .find(|&p| self.is_sentence_start(p))
            .or_else(|| (from..core_start).find(|&p| self.is_word_start(p)))
            .unwrap_or(core_start)
    }
}

fn make_chunk(
    text: &str,
    meta: &DocumentMeta,
    index: usize,
    span: std::ops::Range<usize>,
    core_start: usize,
) -> TextChunk {
    let body = text[span.clone()].to_string();
    let fingerprint = chunk_fingerprint(&body);

    let mut metadata = BTreeMap::new();
    metadata.insert("file_name".to_string(), meta.file_name.clone());
    metadata.insert("format".to_string(), meta.format.to_string());
    metadata.insert("fingerprint".to_string(), fingerprint.clone());
    metadata.insert("source_id".to_string(), meta.source_id.clone());
    metadata.insert("chunk_index".to_string(), index.to_string());

    TextChunk {
        source_id: meta.source_id.clone(),
        index,
        token_estimate: estimate_tokens(&body),
        text: body,
        fingerprint,
        span,
        core_start,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileFormat;

    const WORDS: &[&str] = &[
        "retrieval", "archives", "sensors", "ledgers", "folders", "rivers", "engines",
        "budgets", "signals", "harbors", "gardens", "tickets",
    ];

    fn meta() -> DocumentMeta {
        DocumentMeta {
            source_id: "abc123".into(),
            file_name: "notes.txt".into(),
            format: FileFormat::Text,
        }
    }

    fn prose(min_len: usize) -> String {
        let mut out = String::new();
        let mut i = 0;
        while out.len() < min_len {
            let extra = WORDS[(i * 5) % WORDS.len()];
            out.push_str(&format!(
                "Sentence {} talks about {} and {} near the {}. ",
                i,
                WORDS[i % WORDS.len()],
                WORDS[(i * 3 + 1) % WORDS.len()],
                extra
            ));
            i += 1;
        }
        out.truncate(out.trim_end().len());
        out
    }

    fn cores(chunks: &[TextChunk]) -> String {
        chunks.iter().map(|c| c.core_text()).collect()
    }

    #[test]
    fn token_estimate_rounds_up_by_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("ééééé"), 2);
    }

    #[test]
    fn plan_scales_with_document_length() {
        let cfg = ChunkingConfig::default();

        let short = ChunkPlan::for_document(100, &cfg);
        assert_eq!(short.tier, 0);
        assert_eq!(short.target_tokens, 256);
        assert!((short.overlap_ratio - 0.05).abs() < f64::EPSILON);

        let mid = ChunkPlan::for_document(12_500, &cfg);
        assert_eq!(mid.target_tokens, 1_024);

        let long = ChunkPlan::for_document(1_000_000, &cfg);
        assert_eq!(long.tier, 3);
        assert_eq!(long.target_tokens, 1_536);
        assert!(long.overlap_ratio > mid.overlap_ratio);
    }

    #[test]
    fn plan_clamps_to_bounds() {
        let cfg = ChunkingConfig {
            min_tokens: 300,
            max_overlap_ratio: 0.1,
            ..ChunkingConfig::default()
        };
        let plan = ChunkPlan::for_document(100, &cfg);
        assert_eq!(plan.target_tokens, 300);

        let plan = ChunkPlan::for_document(1_000_000, &cfg);
        assert!((plan.overlap_ratio - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        let cfg = ChunkingConfig::default();
        assert!(chunk_document("", &meta(), &cfg).is_empty());
        assert!(chunk_document("  \n\t \n", &meta(), &cfg).is_empty());
    }

    #[test]
    fn short_document_is_one_chunk_without_overlap() {
        let text = "A short note. Nothing else here.";
        let chunks = chunk_document(text, &meta(), &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].overlap_len(), 0);
        assert_eq!(chunks[0].metadata["file_name"], "notes.txt");
        assert_eq!(chunks[0].metadata["format"], "text");
        assert_eq!(chunks[0].metadata["fingerprint"], chunks[0].fingerprint);
    }

    #[test]
    fn cores_reconstruct_the_document() {
        let text = prose(30_000);
        let chunks = chunk_document(&text, &meta(), &ChunkingConfig::default());
        assert!(chunks.len() > 1);
        assert_eq!(cores(&chunks), text);

        for (i, pair) in chunks.windows(2).enumerate() {
            assert_eq!(pair[0].index, i);
            assert_eq!(pair[1].index, i + 1);
            assert_eq!(pair[0].span.end, pair[1].core_start);
            assert!(pair[1].overlap_len() > 0);
        }
    }

    #[test]
    fn fifty_thousand_chars_stay_within_bounds() {
        let cfg = ChunkingConfig::default();
        let mut text = prose(50_000);
        text.truncate(50_000);
        let chunks = chunk_document(&text, &meta(), &cfg);

        let (last, rest) = chunks.split_last().unwrap();
        assert!(!rest.is_empty());
        for chunk in rest {
            assert!(chunk.token_estimate >= cfg.min_tokens, "{}", chunk.token_estimate);
            assert!(chunk.token_estimate <= cfg.max_tokens, "{}", chunk.token_estimate);
        }
        assert!(last.token_estimate <= cfg.max_tokens);
        assert_eq!(cores(&chunks), text);
    }

    #[test]
    fn cuts_and_overlaps_land_on_sentence_starts() {
        let text = prose(40_000);
        let chunks = chunk_document(&text, &meta(), &ChunkingConfig::default());
        assert!(chunks.len() > 2);

        for pair in chunks.windows(2) {
            let before = text[..pair[1].core_start].trim_end();
            assert!(before.ends_with('.'), "cut inside a sentence: {:?}", &before[before.len() - 20..]);
        }
        for chunk in &chunks {
            assert!(chunk.text.starts_with("Sentence "), "{:?}", &chunk.text[..20]);
        }
    }

    #[test]
    fn falls_back_to_word_starts_without_punctuation() {
        let text: String = (0..6_000).map(|i| format!("{} ", WORDS[i % WORDS.len()])).collect();
        let text = text.trim_end().to_string();
        let chunks = chunk_document(&text, &meta(), &ChunkingConfig::default());
        assert!(chunks.len() > 1);
        assert_eq!(cores(&chunks), text);

        for chunk in &chunks[1..] {
            assert_eq!(&text[chunk.core_start - 1..chunk.core_start], " ");
            assert!(!chunk.text.starts_with(' '));
        }
    }

    #[test]
    fn hints_act_as_boundaries() {
        let rows: Vec<String> = (0..1_000)
            .map(|i| format!("id: {}; name: item {}; city: {}", i, i, WORDS[i % WORDS.len()]))
            .collect();
        let text = rows.join("\n");
        let mut offsets = Vec::new();
        let mut pos = 0;
        for row in &rows {
            offsets.push(pos);
            pos += row.len() + 1;
        }

        let chunks = chunk_with_hints(&text, &offsets, &meta(), &ChunkingConfig::default());
        assert!(chunks.len() > 1);
        for chunk in &chunks[1..] {
            assert!(offsets.contains(&chunk.core_start));
            assert!(chunk.text.starts_with("id: "));
        }
    }

    #[test]
    fn multibyte_text_splits_on_wide_terminators() {
        let text = "これはテストの文です。".repeat(2_000);
        let chunks = chunk_document(&text, &meta(), &ChunkingConfig::default());
        assert!(chunks.len() > 1);
        assert_eq!(cores(&chunks), text);
        for chunk in &chunks[1..] {
            assert!(text[..chunk.core_start].ends_with('。'));
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = prose(20_000);
        let a = chunk_document(&text, &meta(), &ChunkingConfig::default());
        let b = chunk_document(&text, &meta(), &ChunkingConfig::default());
        let fa: Vec<_> = a.iter().map(|c| c.fingerprint.clone()).collect();
        let fb: Vec<_> = b.iter().map(|c| c.fingerprint.clone()).collect();
        assert_eq!(fa, fb);
    }
}
