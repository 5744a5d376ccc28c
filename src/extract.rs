//! Format-specific text extraction.
//!
//! Turns the raw bytes of a supported file into one normalized UTF-8 text
//! blob plus light structural hints (row, record, or heading starts).
//! Extraction never panics on bad input; it returns an [`ExtractError`] and
//! the coordinator skips the file.

use std::path::Path;

use thiserror::Error;

use crate::models::FileFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupt {format} content: {reason}")]
    CorruptContent {
        format: &'static str,
        reason: String,
    },
}

impl ExtractError {
    /// `path` has no extractor, named by its extension.
    pub fn unsupported(path: &Path) -> Self {
        ExtractError::UnsupportedFormat(
            path.extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_else(|| "(none)".to_string()),
        )
    }

    fn corrupt(format: FileFormat, reason: impl ToString) -> Self {
        ExtractError::CorruptContent {
            format: format.as_str(),
            reason: reason.to_string(),
        }
    }
}

/// Byte offsets into [`Extracted::text`] where rows, records, or
/// headings begin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructureHints {
    pub offsets: Vec<usize>,
}

impl StructureHints {
    fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct Extracted {
    pub text: String,
    pub hints: StructureHints,
}

/// Extract plain text from in-memory content.
pub fn extract_text(bytes: &[u8], format: FileFormat) -> Result<Extracted, ExtractError> {
    let extracted = match format {
        FileFormat::Pdf => extract_pdf(bytes)?,
        FileFormat::Csv => extract_csv(bytes)?,
        FileFormat::Json => extract_json(bytes)?,
        FileFormat::Text => Extracted {
            text: normalize_text(decode_utf8(bytes, format)?),
            hints: StructureHints::none(),
        },
        FileFormat::Markdown => extract_markdown(bytes)?,
    };
    if extracted.text.trim().is_empty() {
        return Err(ExtractError::corrupt(format, "no text content"));
    }
    Ok(extracted)
}

fn decode_utf8(bytes: &[u8], format: FileFormat) -> Result<&str, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ExtractError::corrupt(format, e))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Unify line endings, drop control characters, trim trailing spaces on
/// each line, and squeeze runs of blank lines to one.
fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line: String = line
            .chars()
            .filter(|c| !c.is_control() || *c == '\t')
            .collect();
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    // pdf-extract panics on some malformed documents.
    let raw = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::corrupt(FileFormat::Pdf, "parser panicked"))?
        .map_err(|e| ExtractError::corrupt(FileFormat::Pdf, e))?;
    Ok(Extracted {
        text: normalize_text(&raw),
        hints: StructureHints::none(),
    })
}

/// Render each data row as `header: value; header: value` on its own line.
fn extract_csv(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let format = FileFormat::Csv;
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| ExtractError::corrupt(format, e))?
        .clone();

    let mut text = String::new();
    let mut offsets = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::corrupt(format, e))?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let line = record
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_empty())
            .map(|(i, value)| match headers.get(i) {
                Some(h) if !h.is_empty() => format!("{}: {}", h, value),
                _ => value.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        if !text.is_empty() {
            text.push('\n');
        }
        offsets.push(text.len());
        text.push_str(&line);
    }

    if offsets.is_empty() {
        return Err(ExtractError::corrupt(format, "no data rows"));
    }
    Ok(Extracted {
        text,
        hints: StructureHints { offsets },
    })
}

/// Pretty-print a JSON document, falling back to JSON Lines.
fn extract_json(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let format = FileFormat::Json;
    let source = decode_utf8(bytes, format)?;

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(source) {
        if is_empty_json(&value) {
            return Err(ExtractError::corrupt(format, "empty document"));
        }
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| ExtractError::corrupt(format, e))?;
        let offsets = match &value {
            serde_json::Value::Array(items) => record_offsets(&text, items.len()),
            _ => Vec::new(),
        };
        return Ok(Extracted {
            text,
            hints: StructureHints { offsets },
        });
    }

    let mut text = String::new();
    let mut offsets = Vec::new();
    for (lineno, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            ExtractError::corrupt(format, format!("line {}: {}", lineno + 1, e))
        })?;
        let rendered =
            serde_json::to_string_pretty(&value).map_err(|e| ExtractError::corrupt(format, e))?;
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        offsets.push(text.len());
        text.push_str(&rendered);
    }
    if offsets.is_empty() {
        return Err(ExtractError::corrupt(format, "empty document"));
    }
    Ok(Extracted {
        text,
        hints: StructureHints { offsets },
    })
}

fn is_empty_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Offsets of the top-level elements in a pretty-printed array.
///
/// `serde_json` indents top-level elements by exactly two spaces and
/// everything nested by four or more, so an element starts on every line
/// with a two-space indent that is not a closing bracket.
fn record_offsets(pretty: &str, expected: usize) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(expected);
    let mut pos = 0usize;
    for line in pretty.split_inclusive('\n') {
        if let Some(rest) = line.strip_prefix("  ") {
            if !rest.starts_with(|c: char| c == ' ' || c == '}' || c == ']') {
                offsets.push(pos + 2);
            }
        }
        pos += line.len();
    }
    if offsets.len() == expected {
        offsets
    } else {
        Vec::new()
    }
}

/// Markdown keeps its source text; headings are reported as hints.
fn extract_markdown(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = normalize_text(decode_utf8(bytes, FileFormat::Markdown)?);
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    for line in text.split_inclusive('\n') {
        let hashes = line.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) && line[hashes..].starts_with(' ') {
            offsets.push(pos);
        }
        pos += line.len();
    }
    Ok(Extracted {
        text,
        hints: StructureHints { offsets },
    })
}
