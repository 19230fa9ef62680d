use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-state record counts from the segment store.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct StateCounts {
    pub created: i64,
    pub uploading: i64,
    pub uploaded: i64,
    pub retry_queued: i64,
    pub failed: i64,
    pub cleaned: i64,
}

impl StateCounts {
    pub fn pending(&self) -> i64 {
        self.created + self.uploading + self.retry_queued
    }

    pub fn total(&self) -> i64 {
        self.created + self.uploading + self.uploaded + self.retry_queued + self.failed
            + self.cleaned
    }
}

/// Snapshot of pipeline health, served on `/health` and usable from a CLI.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub counts: StateCounts,
    /// Age in seconds of the oldest segment still awaiting delivery.
    pub oldest_pending_age_secs: Option<i64>,
    /// Capture time of the most recently registered segment (liveness signal).
    pub last_segment_at: Option<DateTime<Utc>>,
    /// Bytes of non-cleaned segments currently on local disk.
    pub total_buffer_bytes: i64,
    pub max_buffer_bytes: i64,
    /// True when undeliverable segments alone exceed the buffer ceiling and
    /// registration of new segments is suspended.
    pub backpressure: bool,
    pub healthy: bool,
}

impl HealthReport {
    pub fn evaluate(
        counts: StateCounts,
        oldest_pending: Option<DateTime<Utc>>,
        last_segment_at: Option<DateTime<Utc>>,
        total_buffer_bytes: i64,
        max_buffer_bytes: i64,
        backpressure: bool,
    ) -> Self {
        let now = Utc::now();
        let oldest_pending_age_secs = oldest_pending.map(|t| (now - t).num_seconds().max(0));
        // Healthy: not in backpressure and below 90% of the buffer ceiling.
        let healthy = !backpressure && total_buffer_bytes * 10 < max_buffer_bytes * 9;
        Self {
            counts,
            oldest_pending_age_secs,
            last_segment_at,
            total_buffer_bytes,
            max_buffer_bytes,
            backpressure,
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_counts_pre_upload_states() {
        let counts = StateCounts {
            created: 2,
            uploading: 1,
            uploaded: 5,
            retry_queued: 3,
            failed: 1,
            cleaned: 10,
        };
        assert_eq!(counts.pending(), 6);
        assert_eq!(counts.total(), 22);
    }

    #[test]
    fn report_unhealthy_near_ceiling() {
        let report = HealthReport::evaluate(StateCounts::default(), None, None, 95, 100, false);
        assert!(!report.healthy);
        let report = HealthReport::evaluate(StateCounts::default(), None, None, 50, 100, false);
        assert!(report.healthy);
    }

    #[test]
    fn report_unhealthy_under_backpressure() {
        let report = HealthReport::evaluate(StateCounts::default(), None, None, 0, 100, true);
        assert!(!report.healthy);
        assert!(report.backpressure);
    }
}
