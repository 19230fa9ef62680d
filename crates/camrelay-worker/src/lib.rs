//! Background tasks of the relay daemon: segment discovery and eviction
//! (buffer manager), the delivery worker pool, and the startup reconciler.
//!
//! The tasks never talk to each other directly. All coordination goes through
//! the segment store's atomic claim and transition operations, so any of them
//! can crash and restart without corrupting another's view.

pub mod buffer;
pub mod checksum;
pub mod delivery;
pub mod reconcile;

pub use buffer::{BufferConfig, BufferHandle, BufferManager, EvictionSummary};
pub use checksum::sha256_file;
pub use delivery::{compute_retry_backoff, DeliveryConfig, DeliveryPool};
pub use reconcile::{ReconcileSummary, Reconciler};
