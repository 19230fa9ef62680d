use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// States a segment moves through from capture to local cleanup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Segment file registered, not yet claimed for upload.
    Created,
    /// Claimed by a delivery worker, transfer in progress.
    Uploading,
    /// Transfer confirmed by the remote store.
    Uploaded,
    /// Transfer failed with a retryable error, waiting for `next_attempt_at`.
    RetryQueued,
    /// Terminal delivery failure or attempts exhausted.
    Failed,
    /// Local file deleted. Terminal.
    Cleaned,
}

impl SegmentState {
    /// The forward-only transition table. The only cycle is
    /// `Uploading -> RetryQueued -> Uploading`.
    pub fn can_transition_to(self, to: SegmentState) -> bool {
        use SegmentState::*;
        matches!(
            (self, to),
            (Created, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, RetryQueued)
                | (Uploading, Failed)
                | (RetryQueued, Uploading)
                | (RetryQueued, Failed)
                | (Created, Failed)
                | (Uploaded, Cleaned)
                | (Failed, Cleaned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Cleaned)
    }

    /// Whether a segment in this state still awaits delivery.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            SegmentState::Created | SegmentState::Uploading | SegmentState::RetryQueued
        )
    }

    /// Whether the local file may be deleted. `Failed` files are deletable
    /// only when the discard-failed retention policy is enabled.
    pub fn is_deletable(self, discard_failed: bool) -> bool {
        match self {
            SegmentState::Uploaded => true,
            SegmentState::Failed => discard_failed,
            _ => false,
        }
    }
}

impl Display for SegmentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SegmentState::Created => write!(f, "created"),
            SegmentState::Uploading => write!(f, "uploading"),
            SegmentState::Uploaded => write!(f, "uploaded"),
            SegmentState::RetryQueued => write!(f, "retry_queued"),
            SegmentState::Failed => write!(f, "failed"),
            SegmentState::Cleaned => write!(f, "cleaned"),
        }
    }
}

impl FromStr for SegmentState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SegmentState::Created),
            "uploading" => Ok(SegmentState::Uploading),
            "uploaded" => Ok(SegmentState::Uploaded),
            "retry_queued" => Ok(SegmentState::RetryQueued),
            "failed" => Ok(SegmentState::Failed),
            "cleaned" => Ok(SegmentState::Cleaned),
            _ => Err(anyhow::anyhow!("Invalid segment state: {}", s)),
        }
    }
}

/// A tracked video segment. One record per physical segment file; the record
/// outlives the file (state `Cleaned`) until purged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: String,
    pub camera_id: String,
    /// Absolute path of the local file. Not meaningful once `Cleaned`.
    pub local_path: String,
    /// Deterministic destination key. Never changes after registration, so
    /// repeated upload attempts overwrite the same remote object.
    pub remote_key: String,
    pub size_bytes: i64,
    /// SHA-256 of the file content at registration time, hex-encoded.
    pub checksum: String,
    pub state: SegmentState,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for SegmentRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(SegmentRecord {
            id: row.get("id"),
            camera_id: row.get("camera_id"),
            local_path: row.get("local_path"),
            remote_key: row.get("remote_key"),
            size_bytes: row.get("size_bytes"),
            checksum: row.get("checksum"),
            state: row.get::<String, _>("state").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse segment state: {}", e).into())
            })?,
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            last_attempt_at: row.get("last_attempt_at"),
            next_attempt_at: row.get("next_attempt_at"),
            uploaded_at: row.get("uploaded_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl SegmentRecord {
    pub fn can_retry(&self, max_attempts: i32) -> bool {
        self.attempt_count < max_attempts
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }
}

/// Input for registering a newly observed segment file.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub id: String,
    pub camera_id: String,
    pub local_path: String,
    pub remote_key: String,
    pub size_bytes: i64,
    pub checksum: String,
    /// Capture start time parsed from the filename (falls back to file mtime).
    pub created_at: DateTime<Utc>,
}

/// Parse the capture start time from a segment filename produced by the
/// capture process (`segment_%Y%m%d_%H%M%S.ts`, optionally with a trailing
/// `_NNN` sequence counter).
pub fn parse_capture_start(file_name: &str) -> Option<(DateTime<Utc>, u32)> {
    let stem = file_name.strip_suffix(".ts")?;
    let rest = stem.strip_prefix("segment_")?;

    // Timestamp is the first 15 characters: YYYYMMDD_HHMMSS.
    if rest.len() < 15 {
        return None;
    }
    let (ts_part, tail) = rest.split_at(15);
    let naive = NaiveDateTime::parse_from_str(ts_part, "%Y%m%d_%H%M%S").ok()?;
    let started_at = Utc.from_utc_datetime(&naive);

    let sequence = tail
        .strip_prefix('_')
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    Some((started_at, sequence))
}

/// Build the stable segment identifier from camera id, capture start time and
/// per-camera sequence index. Lexicographic order matches capture order.
pub fn segment_id(camera_id: &str, started_at: DateTime<Utc>, sequence: u32) -> String {
    format!(
        "{}-{}-{:04}",
        camera_id,
        started_at.format("%Y%m%dT%H%M%S"),
        sequence
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_round_trip() {
        for state in [
            SegmentState::Created,
            SegmentState::Uploading,
            SegmentState::Uploaded,
            SegmentState::RetryQueued,
            SegmentState::Failed,
            SegmentState::Cleaned,
        ] {
            assert_eq!(state.to_string().parse::<SegmentState>().unwrap(), state);
        }
        assert!("bogus".parse::<SegmentState>().is_err());
    }

    #[test]
    fn transition_table_forward_only() {
        use SegmentState::*;
        assert!(Created.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Uploaded));
        assert!(Uploading.can_transition_to(RetryQueued));
        assert!(Uploading.can_transition_to(Failed));
        assert!(RetryQueued.can_transition_to(Uploading));
        assert!(Uploaded.can_transition_to(Cleaned));
        assert!(Failed.can_transition_to(Cleaned));

        // No skips, no backward edges.
        assert!(!Created.can_transition_to(Uploaded));
        assert!(!Created.can_transition_to(Cleaned));
        assert!(!Uploaded.can_transition_to(Uploading));
        assert!(!Cleaned.can_transition_to(Created));
        assert!(!RetryQueued.can_transition_to(Uploaded));
    }

    #[test]
    fn deletable_states_respect_policy() {
        assert!(SegmentState::Uploaded.is_deletable(false));
        assert!(SegmentState::Failed.is_deletable(true));
        assert!(!SegmentState::Failed.is_deletable(false));
        assert!(!SegmentState::Created.is_deletable(true));
        assert!(!SegmentState::Uploading.is_deletable(true));
        assert!(!SegmentState::RetryQueued.is_deletable(true));
    }

    #[test]
    fn parse_capture_start_plain() {
        let (ts, seq) = parse_capture_start("segment_20260825_101530.ts").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-08-25 10:15:30");
        assert_eq!(seq, 0);
    }

    #[test]
    fn parse_capture_start_with_sequence() {
        let (_, seq) = parse_capture_start("segment_20260825_101530_007.ts").unwrap();
        assert_eq!(seq, 7);
    }

    #[test]
    fn parse_capture_start_rejects_foreign_names() {
        assert!(parse_capture_start("live.m3u8").is_none());
        assert!(parse_capture_start("segment_garbage.ts").is_none());
        assert!(parse_capture_start("other_20260825_101530.ts").is_none());
    }

    #[test]
    fn segment_id_sorts_by_capture_order() {
        let earlier = Utc.with_ymd_and_hms(2026, 8, 25, 10, 15, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 8, 25, 10, 15, 10).unwrap();
        let a = segment_id("cam1", earlier, 1);
        let b = segment_id("cam1", earlier, 2);
        let c = segment_id("cam1", later, 0);
        assert!(a < b);
        assert!(b < c);
    }
}
