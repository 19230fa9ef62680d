//! Data models for the segment relay pipeline.

pub mod health;
pub mod segment;

pub use health::{HealthReport, StateCounts};
pub use segment::{NewSegment, SegmentRecord, SegmentState};
