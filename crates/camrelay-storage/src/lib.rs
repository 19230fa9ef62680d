//! Remote storage backends for segment delivery.
//!
//! Uploads are idempotent: the remote key for a segment is a pure function of
//! its camera, capture time and filename, so re-delivering after a crash
//! overwrites the same object instead of duplicating it.

pub mod factory;
pub mod keys;
pub mod local;
pub mod s3;
pub mod traits;

pub use factory::create_remote_storage;
pub use keys::remote_key;
pub use local::LocalRemoteStorage;
pub use s3::S3RemoteStorage;
pub use traits::{RemoteStorage, UploadError, UploadResult};
