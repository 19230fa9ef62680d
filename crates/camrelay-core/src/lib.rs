//! Camrelay core library
//!
//! Shared types for the segment relay pipeline: the segment lifecycle model,
//! configuration, and the error taxonomy used across crates.

pub mod config;
pub mod error;
pub mod models;

pub use config::{Config, StorageBackend};
pub use error::{DataIntegrityError, StoreError};
pub use models::{HealthReport, NewSegment, SegmentRecord, SegmentState, StateCounts};
