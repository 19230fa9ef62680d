//! Error taxonomy for the segment relay pipeline.
//!
//! Store-level violations (`StoreError`) are programming or invariant errors:
//! they abort the calling operation and are logged, but a single bad segment
//! must never stop ingestion or delivery of others. Integrity findings
//! (`DataIntegrityError`) are produced by the reconciler and routed to the
//! `Failed` state rather than retried.

use crate::models::SegmentState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate segment: {id}")]
    DuplicateSegment { id: String },

    #[error("Invalid transition for segment {id}: {found} -> {requested}")]
    InvalidTransition {
        id: String,
        found: SegmentState,
        requested: SegmentState,
    },

    #[error("Segment record not found: {0}")]
    RecordNotFound(String),

    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// True for errors worth retrying at the store level (I/O contention,
    /// busy database). Invariant violations are not retryable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Integrity findings from reconciliation. Both route the segment to `Failed`
/// without further upload attempts; `DataLossDetected` is the one condition
/// the design can only detect, not prevent, and must be logged at the highest
/// severity.
#[derive(Debug, thiserror::Error)]
pub enum DataIntegrityError {
    #[error("Corrupt segment {id}: {detail}")]
    CorruptSegment { id: String, detail: String },

    #[error("Data loss detected for segment {id}: local file missing before confirmed upload")]
    DataLossDetected { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violations_not_recoverable() {
        let err = StoreError::DuplicateSegment {
            id: "cam1-20260825T101500-0000".to_string(),
        };
        assert!(!err.is_recoverable());

        let err = StoreError::InvalidTransition {
            id: "cam1-20260825T101500-0000".to_string(),
            found: SegmentState::Uploaded,
            requested: SegmentState::Uploading,
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("uploaded -> uploading"));
    }
}
