use crate::traits::{RemoteStorage, UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Filesystem delivery backend, for development and for sites that sync a
/// mounted NAS path instead of object storage.
#[derive(Clone)]
pub struct LocalRemoteStorage {
    base_path: PathBuf,
}

impl LocalRemoteStorage {
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            anyhow::anyhow!(
                "failed to create destination directory {}: {}",
                base_path.display(),
                e
            )
        })?;
        Ok(LocalRemoteStorage { base_path })
    }

    fn key_to_path(&self, key: &str) -> UploadResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') {
            return Err(UploadError::Terminal(format!(
                "key escapes destination directory: {key}"
            )));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl RemoteStorage for LocalRemoteStorage {
    async fn put(&self, key: &str, data: Bytes) -> UploadResult<()> {
        let path = self.key_to_path(key)?;
        let size = data.len() as u64;
        let start = std::time::Instant::now();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UploadError::Retryable(e.to_string()))?;
        }

        // Write to a sibling temp file and rename, so a crash mid-write never
        // leaves a truncated object at the final key.
        let tmp = path.with_extension("part");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| UploadError::Retryable(e.to_string()))?;
        file.write_all(&data)
            .await
            .map_err(|e| UploadError::Retryable(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| UploadError::Retryable(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| UploadError::Retryable(e.to_string()))?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local delivery successful"
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> UploadResult<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    fn describe(&self) -> String {
        self.base_path.display().to_string()
    }
}
