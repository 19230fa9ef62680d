use crate::{LocalRemoteStorage, RemoteStorage, S3RemoteStorage};
use camrelay_core::{Config, StorageBackend};
use std::sync::Arc;

/// Create the configured remote storage backend.
pub async fn create_remote_storage(config: &Config) -> Result<Arc<dyn RemoteStorage>, anyhow::Error> {
    match config.storage_backend {
        StorageBackend::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("S3_BUCKET not configured"))?;
            let region = config
                .s3_region
                .clone()
                .ok_or_else(|| anyhow::anyhow!("S3_REGION or AWS_REGION not configured"))?;
            let storage = S3RemoteStorage::new(bucket, region, config.s3_endpoint.clone())?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Local => {
            let base_path = config
                .local_remote_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("LOCAL_REMOTE_PATH not configured"))?;
            let storage = LocalRemoteStorage::new(base_path).await?;
            Ok(Arc::new(storage))
        }
    }
}
