//! Camrelay segment store
//!
//! Durable, crash-safe SQLite store for segment lifecycle records. This is the
//! single source of truth for lifecycle decisions: every cross-component
//! coordination point (claiming work, transitioning state, eviction queries)
//! is an atomic statement here.

pub mod store;

pub use store::SegmentStore;
