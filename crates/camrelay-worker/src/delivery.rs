//! Delivery worker pool: claims pending segments from the store and uploads
//! them to remote storage, bounded by a semaphore.
//!
//! Shutdown: [`DeliveryPool::shutdown`] signals the coordinator to stop
//! claiming; in-flight uploads finish on their own or are reverted by the next
//! startup's reconciler.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;

use camrelay_db::SegmentStore;
use camrelay_storage::{RemoteStorage, UploadError};

#[derive(Clone)]
pub struct DeliveryConfig {
    pub workers: usize,
    pub claim_batch_size: i64,
    pub upload_timeout: Duration,
    pub max_attempts: i32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter_ratio: f64,
    pub poll_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            claim_batch_size: 8,
            upload_timeout: Duration::from_secs(30),
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(600),
            retry_jitter_ratio: 0.2,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Backoff before attempt `attempt_count + 1`: exponential in the number of
/// attempts already made, capped, with symmetric jitter so a fleet of cameras
/// recovering from one outage does not retry in lockstep.
pub fn compute_retry_backoff(
    attempt_count: i32,
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
) -> Duration {
    let exponent = attempt_count.saturating_sub(1).clamp(0, 31);
    let mut delay = (base.as_secs_f64() * 2_f64.powi(exponent)).min(max.as_secs_f64());
    if jitter_ratio > 0.0 {
        let jitter: f64 = rand::rng().random_range(-jitter_ratio..=jitter_ratio);
        delay *= 1.0 + jitter;
    }
    Duration::from_secs_f64(delay.min(max.as_secs_f64()).max(0.0))
}

pub struct DeliveryPool {
    shutdown_tx: mpsc::Sender<()>,
}

impl DeliveryPool {
    /// Spawn the coordinator loop and return a handle for shutdown.
    pub fn spawn(
        store: SegmentStore,
        remote: Arc<dyn RemoteStorage>,
        config: DeliveryConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            Self::coordinator(store, remote, config, shutdown_rx).await;
        });
        Self { shutdown_tx }
    }

    /// Signal the coordinator to stop claiming. Returns immediately; does not
    /// wait for in-flight uploads.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn coordinator(
        store: SegmentStore,
        remote: Arc<dyn RemoteStorage>,
        config: DeliveryConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            workers = config.workers,
            claim_batch_size = config.claim_batch_size,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            destination = %remote.describe(),
            "Delivery pool started"
        );

        let semaphore = Arc::new(Semaphore::new(config.workers));

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Delivery pool shutting down");
                    break;
                }
                _ = sleep(config.poll_interval) => {
                    Self::claim_and_dispatch(&store, &remote, &config, &semaphore).await;
                }
            }
        }

        tracing::info!("Delivery pool stopped");
    }

    async fn claim_and_dispatch(
        store: &SegmentStore,
        remote: &Arc<dyn RemoteStorage>,
        config: &DeliveryConfig,
        semaphore: &Arc<Semaphore>,
    ) {
        // Take permits up front, then claim exactly that many rows. A claimed
        // segment always has a worker slot waiting for it.
        let mut permits = Vec::new();
        while (permits.len() as i64) < config.claim_batch_size {
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            tracing::trace!("No delivery workers available, skipping claim");
            return;
        }

        let claimed = match store.claim_next_for_delivery(permits.len() as i64).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim segments for delivery");
                return;
            }
        };

        for segment in claimed {
            let permit = match permits.pop() {
                Some(permit) => permit,
                None => break,
            };
            let store = store.clone();
            let remote = remote.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                deliver_one(&store, remote.as_ref(), &config, segment).await;
            });
        }
    }
}

/// Run one delivery attempt for a claimed (UPLOADING) segment and record the
/// outcome in the store.
pub(crate) async fn deliver_one(
    store: &SegmentStore,
    remote: &dyn RemoteStorage,
    config: &DeliveryConfig,
    segment: camrelay_core::SegmentRecord,
) {
    let start = std::time::Instant::now();

    let data = match tokio::fs::read(&segment.local_path).await {
        Ok(data) => Bytes::from(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let finding = camrelay_core::DataIntegrityError::DataLossDetected {
                id: segment.id.clone(),
            };
            tracing::error!(
                segment_id = %segment.id,
                local_path = %segment.local_path,
                error = %finding,
                "Segment file missing before delivery, marking failed"
            );
            fail(store, &segment.id, &finding.to_string()).await;
            return;
        }
        Err(e) => {
            schedule(store, config, &segment, &format!("read failed: {e}")).await;
            return;
        }
    };

    let outcome = tokio::time::timeout(
        config.upload_timeout,
        remote.put(&segment.remote_key, data),
    )
    .await;

    match outcome {
        Ok(Ok(())) => match store.mark_uploaded(&segment.id).await {
            Ok(_) => {
                tracing::info!(
                    segment_id = %segment.id,
                    remote_key = %segment.remote_key,
                    size_bytes = segment.size_bytes,
                    attempt = segment.attempt_count,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Segment delivered"
                );
            }
            Err(e) => {
                tracing::error!(segment_id = %segment.id, error = %e, "Failed to record delivery");
            }
        },
        Ok(Err(UploadError::Terminal(reason))) => {
            tracing::error!(
                segment_id = %segment.id,
                remote_key = %segment.remote_key,
                error = %reason,
                "Terminal delivery failure, will not retry"
            );
            fail(store, &segment.id, &reason).await;
        }
        Ok(Err(UploadError::Retryable(reason))) => {
            schedule(store, config, &segment, &reason).await;
        }
        Err(_) => {
            let reason = format!(
                "upload timed out after {}s",
                config.upload_timeout.as_secs()
            );
            schedule(store, config, &segment, &reason).await;
        }
    }
}

/// Retryable outcome: re-queue with backoff, or give up past the attempt cap.
async fn schedule(
    store: &SegmentStore,
    config: &DeliveryConfig,
    segment: &camrelay_core::SegmentRecord,
    reason: &str,
) {
    if !segment.can_retry(config.max_attempts) {
        tracing::error!(
            segment_id = %segment.id,
            attempts = segment.attempt_count,
            error = %reason,
            "Delivery failed after maximum attempts"
        );
        fail(
            store,
            &segment.id,
            &format!("exhausted {} attempts: {reason}", segment.attempt_count),
        )
        .await;
        return;
    }

    let backoff = compute_retry_backoff(
        segment.attempt_count,
        config.retry_base_delay,
        config.retry_max_delay,
        config.retry_jitter_ratio,
    );
    let next_attempt_at = Utc::now()
        + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(0));

    tracing::warn!(
        segment_id = %segment.id,
        attempt = segment.attempt_count,
        backoff_secs = backoff.as_secs_f64(),
        error = %reason,
        "Delivery failed, retry scheduled"
    );

    if let Err(e) = store.schedule_retry(&segment.id, reason, next_attempt_at).await {
        tracing::error!(segment_id = %segment.id, error = %e, "Failed to schedule retry");
    }
}

async fn fail(store: &SegmentStore, id: &str, reason: &str) {
    if let Err(e) = store.mark_failed(id, reason).await {
        tracing::error!(segment_id = %id, error = %e, "Failed to mark segment failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use camrelay_core::{NewSegment, SegmentState};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Remote with scripted per-call outcomes.
    struct ScriptedRemote {
        outcomes: Mutex<VecDeque<Result<(), UploadError>>>,
        puts: Mutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn new(outcomes: Vec<Result<(), UploadError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                puts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteStorage for ScriptedRemote {
        async fn put(&self, key: &str, _data: Bytes) -> Result<(), UploadError> {
            self.puts.lock().unwrap().push(key.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn exists(&self, _key: &str) -> Result<bool, UploadError> {
            Ok(false)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    async fn setup() -> (TempDir, SegmentStore, DeliveryConfig) {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::connect(&dir.path().join("test.db"))
            .await
            .unwrap();
        let config = DeliveryConfig {
            retry_jitter_ratio: 0.0,
            ..DeliveryConfig::default()
        };
        (dir, store, config)
    }

    async fn claimed_segment(
        dir: &TempDir,
        store: &SegmentStore,
        name: &str,
    ) -> camrelay_core::SegmentRecord {
        let path = dir.path().join(name);
        std::fs::write(&path, b"ts payload").unwrap();
        store
            .register(NewSegment {
                id: format!("cam1-{name}"),
                camera_id: "cam1".to_string(),
                local_path: path.to_string_lossy().into_owned(),
                remote_key: format!("cameras/cam1/2026/08/25/10/{name}"),
                size_bytes: 10,
                checksum: "0".repeat(64),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .claim_next_for_delivery(1)
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_marks_uploaded() {
        let (dir, store, config) = setup().await;
        let segment = claimed_segment(&dir, &store, "a.ts").await;
        let remote = ScriptedRemote::new(vec![Ok(())]);

        deliver_one(&store, &remote, &config, segment.clone()).await;

        let record = store.get(&segment.id).await.unwrap().unwrap();
        assert_eq!(record.state, SegmentState::Uploaded);
        assert!(record.uploaded_at.is_some());
        assert_eq!(remote.puts.lock().unwrap().as_slice(), [segment.remote_key]);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_deadline() {
        let (dir, store, config) = setup().await;
        let segment = claimed_segment(&dir, &store, "a.ts").await;
        let remote =
            ScriptedRemote::new(vec![Err(UploadError::Retryable("connection reset".into()))]);

        deliver_one(&store, &remote, &config, segment.clone()).await;

        let record = store.get(&segment.id).await.unwrap().unwrap();
        assert_eq!(record.state, SegmentState::RetryQueued);
        assert!(record.next_attempt_at.unwrap() > Utc::now());
        assert_eq!(record.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn terminal_failure_marks_failed() {
        let (dir, store, config) = setup().await;
        let segment = claimed_segment(&dir, &store, "a.ts").await;
        let remote =
            ScriptedRemote::new(vec![Err(UploadError::Terminal("access denied".into()))]);

        deliver_one(&store, &remote, &config, segment.clone()).await;

        let record = store.get(&segment.id).await.unwrap().unwrap();
        assert_eq!(record.state, SegmentState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("access denied"));
    }

    #[tokio::test]
    async fn attempts_exhausted_marks_failed() {
        let (dir, store, mut config) = setup().await;
        config.max_attempts = 1;
        let segment = claimed_segment(&dir, &store, "a.ts").await;
        let remote = ScriptedRemote::new(vec![Err(UploadError::Retryable("timeout".into()))]);

        deliver_one(&store, &remote, &config, segment.clone()).await;

        let record = store.get(&segment.id).await.unwrap().unwrap();
        assert_eq!(record.state, SegmentState::Failed);
        assert!(record.last_error.unwrap().contains("exhausted 1 attempts"));
    }

    #[tokio::test]
    async fn missing_file_is_data_loss() {
        let (dir, store, config) = setup().await;
        let segment = claimed_segment(&dir, &store, "a.ts").await;
        std::fs::remove_file(&segment.local_path).unwrap();
        let remote = ScriptedRemote::new(vec![]);

        deliver_one(&store, &remote, &config, segment.clone()).await;

        let record = store.get(&segment.id).await.unwrap().unwrap();
        assert_eq!(record.state, SegmentState::Failed);
        assert!(remote.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivery_targets_same_remote_key() {
        let (dir, store, mut config) = setup().await;
        // Zero base delay so the retry is claimable immediately.
        config.retry_base_delay = Duration::ZERO;
        let segment = claimed_segment(&dir, &store, "a.ts").await;
        let remote = ScriptedRemote::new(vec![
            Err(UploadError::Retryable("reset".into())),
            Ok(()),
        ]);

        deliver_one(&store, &remote, &config, segment.clone()).await;
        let reclaimed = store
            .claim_next_for_delivery(1)
            .await
            .unwrap()
            .pop()
            .unwrap();
        deliver_one(&store, &remote, &config, reclaimed).await;

        let puts = remote.puts.lock().unwrap();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0], puts[1]);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(600);
        assert_eq!(compute_retry_backoff(1, base, max, 0.0), Duration::from_secs(5));
        assert_eq!(compute_retry_backoff(2, base, max, 0.0), Duration::from_secs(10));
        assert_eq!(compute_retry_backoff(3, base, max, 0.0), Duration::from_secs(20));
        assert_eq!(compute_retry_backoff(8, base, max, 0.0), Duration::from_secs(600));
        assert_eq!(compute_retry_backoff(100, base, max, 0.0), Duration::from_secs(600));
    }

    #[test]
    fn backoff_non_decreasing_up_to_cap() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(600);
        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = compute_retry_backoff(attempt, base, max, 0.0);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(600);
        for _ in 0..100 {
            let delay = compute_retry_backoff(1, base, max, 0.2).as_secs_f64();
            assert!((8.0..=12.0).contains(&delay), "delay {delay} out of range");
        }
    }
}
