//! Core data models used throughout Ragi.
//!
//! These types represent the files, chunks, fingerprints, and conversation
//! records that flow through the ingestion pipeline and the memory scorer.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Document formats the extractor understands.
///
/// Detection is by file extension only; content sniffing is never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Pdf,
    Csv,
    Json,
    Text,
    Markdown,
}

impl FileFormat {
    /// Map a lowercase-insensitive extension (without the dot) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileFormat::Pdf),
            "csv" => Some(FileFormat::Csv),
            "json" | "jsonl" | "ndjson" => Some(FileFormat::Json),
            "txt" | "text" => Some(FileFormat::Text),
            "md" | "markdown" => Some(FileFormat::Markdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "pdf",
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
            FileFormat::Text => "text",
            FileFormat::Markdown => "markdown",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a watched file is in its settle cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityState {
    /// Observed at least once; size or mtime may still change.
    Settling,
    /// Unchanged across two observations one settle interval apart.
    Stable,
}

/// A file in the watched folder as last observed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub format: Option<FileFormat>,
    pub size: u64,
    pub modified: SystemTime,
    pub state: StabilityState,
}

/// File name component of a path, lossily converted.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Document-level metadata shared by every chunk of one source file.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    /// File-level fingerprint; identifies the owning source file.
    pub source_id: String,
    pub file_name: String,
    pub format: FileFormat,
}

/// A bounded span of a document prepared for indexing.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub source_id: String,
    pub index: usize,
    pub text: String,
    pub token_estimate: usize,
    /// SHA-256 over the whitespace-normalized chunk text.
    pub fingerprint: String,
    /// Byte range of `text` within the extracted document.
    pub span: Range<usize>,
    /// Byte offset where this chunk's own (non-overlapping) text begins.
    pub core_start: usize,
    pub metadata: BTreeMap<String, String>,
}

impl TextChunk {
    /// The part of the chunk not shared with its predecessor.
    pub fn core_text(&self) -> &str {
        &self.text[self.core_start - self.span.start..]
    }

    /// Length in bytes of the leading overlap.
    pub fn overlap_len(&self) -> usize {
        self.core_start - self.span.start
    }
}

/// Namespace of a stored fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintKind {
    File,
    Chunk,
}

impl FingerprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintKind::File => "file",
            FingerprintKind::Chunk => "chunk",
        }
    }
}

/// First sighting of a fingerprint.
#[derive(Debug, Clone)]
pub struct DuplicateRecord {
    pub kind: FingerprintKind,
    pub fingerprint: String,
    pub source_name: String,
    pub first_seen: DateTime<Utc>,
}

/// A stored question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionRecord {
    pub id: String,
    /// SHA-256 over the normalized query and response.
    pub memory_key: String,
    pub query: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub important: bool,
}

impl InteractionRecord {
    /// Rendering used when the exchange is merged into a prompt.
    pub fn conversation(&self) -> String {
        format!("User: {}\nAI: {}", self.query, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension_is_case_insensitive() {
        assert_eq!(FileFormat::from_extension("PDF"), Some(FileFormat::Pdf));
        assert_eq!(FileFormat::from_extension("jsonl"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("Md"), Some(FileFormat::Markdown));
        assert_eq!(FileFormat::from_extension("docx"), None);
    }

    #[test]
    fn core_text_skips_overlap() {
        let chunk = TextChunk {
            source_id: "s".into(),
            index: 1,
            text: "tail. Next one.".into(),
            token_estimate: 4,
            fingerprint: String::new(),
            span: 10..25,
            core_start: 16,
            metadata: BTreeMap::new(),
        };
        assert_eq!(chunk.core_text(), "Next one.");
        assert_eq!(chunk.overlap_len(), 6);
    }
}
