//! Failure taxonomy for a single ingestion run.
//!
//! Every variant is scoped to one file: the coordinator logs it, decides
//! whether to park the file, and keeps polling. Only
//! [`IngestError::StoreUnavailable`] is also reported to [`Health`](crate::coordinator::Health).

use thiserror::Error;

use crate::extract::ExtractError;
use crate::stability::SkipReason;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    /// File is ineligible or never settled; retried when it changes.
    #[error("validation skip: {0}")]
    ValidationSkip(#[from] SkipReason),

    /// Format-specific text extraction failed; the file stays in place.
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    /// Content was already ingested under another name.
    #[error("duplicate of '{of}'")]
    DuplicateDetected { of: String },

    /// The vector index rejected the batch on every attempt.
    #[error("indexing failed after {attempts} attempt(s): {reason}")]
    IndexingFailure { attempts: u32, reason: String },

    /// The fingerprint or interaction store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Indexing succeeded but the source could not be moved to the archive.
    #[error("archive failed: {0}")]
    Archive(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn store(err: anyhow::Error) -> Self {
        IngestError::StoreUnavailable(format!("{:#}", err))
    }

    /// Whether the file should be left alone until its contents change.
    ///
    /// Store outages and archive failures are transient and retried on the
    /// next poll instead.
    pub fn parks_file(&self) -> bool {
        matches!(
            self,
            IngestError::ValidationSkip(_)
                | IngestError::Extraction(_)
                | IngestError::IndexingFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = IngestError::IndexingFailure {
            attempts: 4,
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "indexing failed after 4 attempt(s): connection refused"
        );
    }

    #[test]
    fn store_outage_is_not_parked() {
        assert!(!IngestError::StoreUnavailable("db locked".into()).parks_file());
        assert!(IngestError::ValidationSkip(SkipReason::Empty).parks_file());
    }
}
