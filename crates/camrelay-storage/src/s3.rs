use crate::traits::{RemoteStorage, UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectStoreExt, PutPayload};

/// S3 delivery backend.
#[derive(Clone)]
pub struct S3RemoteStorage {
    store: AmazonS3,
    bucket: String,
}

impl S3RemoteStorage {
    /// Build an S3 backend from explicit settings plus AWS environment
    /// credentials. `endpoint_url` targets S3-compatible providers
    /// (e.g. "http://localhost:9000" for MinIO).
    pub fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket.clone());

        if let Some(endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder.with_endpoint(endpoint).with_allow_http(allow_http);
        }

        let store = builder.build()?;
        Ok(S3RemoteStorage { store, bucket })
    }
}

#[async_trait]
impl RemoteStorage for S3RemoteStorage {
    async fn put(&self, key: &str, data: Bytes) -> UploadResult<()> {
        let size = data.len() as u64;
        let location = Path::from(key);
        let start = std::time::Instant::now();

        self.store
            .put(&location, PutPayload::from(data))
            .await
            .map_err(|e| {
                tracing::warn!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                UploadError::from_object_store(e)
            })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> UploadResult<bool> {
        let location = Path::from(key);
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(UploadError::from_object_store(e)),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
