//! Remote key layout.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Build the remote object key for a segment:
/// `{prefix}/{camera_id}/{YYYY}/{MM}/{DD}/{HH}/{file_name}`.
///
/// The hour partition comes from the capture start time in UTC, never from
/// upload time, so a segment delivered hours late still lands next to its
/// neighbours.
pub fn remote_key(
    prefix: &str,
    camera_id: &str,
    started_at: DateTime<Utc>,
    file_name: &str,
) -> String {
    format!(
        "{}/{}/{:04}/{:02}/{:02}/{:02}/{}",
        prefix.trim_matches('/'),
        camera_id,
        started_at.year(),
        started_at.month(),
        started_at.day(),
        started_at.hour(),
        file_name
    )
}
