//! Local buffer manager: discovers finished capture files and keeps disk
//! usage inside the configured budget.
//!
//! Discovery never races the capture process: a file is registered only after
//! its size has held still across two observations separated by the stability
//! window. Eviction never unlinks a file whose record is not deletable; when
//! undeletable bytes alone exceed the budget the manager raises the
//! backpressure flag and stops registering instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use camrelay_core::models::segment::{parse_capture_start, segment_id};
use camrelay_core::{NewSegment, SegmentRecord, StoreError};
use camrelay_db::SegmentStore;
use camrelay_storage::remote_key;

use crate::checksum::sha256_file;

#[derive(Clone)]
pub struct BufferConfig {
    pub camera_id: String,
    pub segments_dir: PathBuf,
    pub remote_prefix: String,
    pub scan_interval: Duration,
    pub stability_window: Duration,
    pub retention_minutes: i64,
    pub max_buffer_bytes: i64,
    pub eviction_interval: Duration,
    pub discard_failed: bool,
    pub record_retention_days: i64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    pub evicted_by_age: usize,
    pub evicted_by_size: usize,
    pub purged_records: u64,
}

pub struct BufferHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl BufferHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

pub struct BufferManager {
    store: SegmentStore,
    config: BufferConfig,
    backpressure: Arc<AtomicBool>,
    /// Last observed (size, when) per unregistered file, for the stability check.
    observations: HashMap<PathBuf, (u64, Instant)>,
}

impl BufferManager {
    pub fn new(store: SegmentStore, config: BufferConfig) -> Self {
        Self {
            store,
            config,
            backpressure: Arc::new(AtomicBool::new(false)),
            observations: HashMap::new(),
        }
    }

    /// Shared flag, surfaced in the health report.
    pub fn backpressure_flag(&self) -> Arc<AtomicBool> {
        self.backpressure.clone()
    }

    /// Spawn the scan and eviction loops; the handle stops both.
    pub fn spawn(mut self) -> BufferHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            tracing::info!(
                segments_dir = %self.config.segments_dir.display(),
                scan_interval_ms = self.config.scan_interval.as_millis() as u64,
                eviction_interval_ms = self.config.eviction_interval.as_millis() as u64,
                max_buffer_bytes = self.config.max_buffer_bytes,
                "Buffer manager started"
            );

            let mut scan_tick = tokio::time::interval(self.config.scan_interval);
            scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut evict_tick = tokio::time::interval(self.config.eviction_interval);
            evict_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Buffer manager shutting down");
                        break;
                    }
                    _ = scan_tick.tick() => {
                        if let Err(e) = self.scan_once().await {
                            tracing::error!(error = %e, "Segment scan failed");
                        }
                    }
                    _ = evict_tick.tick() => {
                        if let Err(e) = self.evict_once().await {
                            tracing::error!(error = %e, "Eviction pass failed");
                        }
                    }
                }
            }
        });

        BufferHandle { shutdown_tx }
    }

    /// One discovery pass. Returns how many segments were registered.
    pub async fn scan_once(&mut self) -> anyhow::Result<usize> {
        if self.backpressure.load(Ordering::Relaxed) {
            tracing::debug!("Backpressure active, skipping segment registration");
            return Ok(0);
        }

        let mut registered = 0;
        let mut dir = tokio::fs::read_dir(&self.config.segments_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((started_at, sequence)) = parse_capture_start(name) else {
                continue;
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let size = metadata.len();

            let path_str = path.to_string_lossy().into_owned();
            if self.store.get_by_local_path(&path_str).await?.is_some() {
                self.observations.remove(&path);
                continue;
            }

            let stable = match self.observations.get(&path) {
                Some((seen_size, seen_at)) => {
                    *seen_size == size && seen_at.elapsed() >= self.config.stability_window
                }
                None => false,
            };
            if !stable {
                // Not yet observed, or still growing. Start a fresh window.
                let entry = self.observations.entry(path.clone()).or_insert((size, Instant::now()));
                if entry.0 != size {
                    *entry = (size, Instant::now());
                }
                continue;
            }

            let checksum = sha256_file(&path).await?;
            let segment = NewSegment {
                id: segment_id(&self.config.camera_id, started_at, sequence),
                camera_id: self.config.camera_id.clone(),
                local_path: path_str,
                remote_key: remote_key(
                    &self.config.remote_prefix,
                    &self.config.camera_id,
                    started_at,
                    name,
                ),
                size_bytes: size as i64,
                checksum,
                created_at: started_at,
            };

            match self.store.register(segment).await {
                Ok(record) => {
                    tracing::info!(
                        segment_id = %record.id,
                        local_path = %record.local_path,
                        size_bytes = record.size_bytes,
                        "Segment discovered"
                    );
                    registered += 1;
                }
                Err(StoreError::DuplicateSegment { id }) => {
                    tracing::debug!(segment_id = %id, "Segment already tracked");
                }
                Err(e) => return Err(e.into()),
            }
            self.observations.remove(&path);
        }

        Ok(registered)
    }

    /// One eviction pass: age policy, then the byte budget, then record
    /// retention, then the backpressure evaluation.
    pub async fn evict_once(&self) -> anyhow::Result<EvictionSummary> {
        let mut summary = EvictionSummary::default();

        let age_cutoff = Utc::now() - chrono::Duration::minutes(self.config.retention_minutes);
        for record in self.store.list_uploaded_before(age_cutoff).await? {
            if self.clean(&record).await? {
                summary.evicted_by_age += 1;
            }
        }

        let mut total = self.store.total_buffer_bytes().await?;
        while total > self.config.max_buffer_bytes {
            let candidates = self
                .store
                .list_deletable(self.config.discard_failed, 100)
                .await?;
            if candidates.is_empty() {
                break;
            }
            let mut cleaned_this_pass = 0;
            for record in candidates {
                if total <= self.config.max_buffer_bytes {
                    break;
                }
                if self.clean(&record).await? {
                    summary.evicted_by_size += 1;
                    cleaned_this_pass += 1;
                    total -= record.size_bytes;
                }
            }
            if cleaned_this_pass == 0 {
                break;
            }
        }

        let record_cutoff = Utc::now() - chrono::Duration::days(self.config.record_retention_days);
        summary.purged_records = self.store.purge_cleaned_before(record_cutoff).await?;

        let pending = self.store.pending_bytes(self.config.discard_failed).await?;
        let pressured = pending > self.config.max_buffer_bytes;
        let was = self.backpressure.swap(pressured, Ordering::Relaxed);
        if pressured && !was {
            tracing::error!(
                pending_bytes = pending,
                max_buffer_bytes = self.config.max_buffer_bytes,
                "Undeliverable backlog exceeds buffer budget, registration paused"
            );
        } else if !pressured && was {
            tracing::info!(pending_bytes = pending, "Backpressure cleared");
        }

        if summary.evicted_by_age > 0 || summary.evicted_by_size > 0 || summary.purged_records > 0 {
            tracing::info!(
                evicted_by_age = summary.evicted_by_age,
                evicted_by_size = summary.evicted_by_size,
                purged_records = summary.purged_records,
                "Eviction pass complete"
            );
        }
        Ok(summary)
    }

    /// Unlink a deletable segment's file and record the cleanup. A file that
    /// is already gone still advances the record to cleaned.
    async fn clean(&self, record: &SegmentRecord) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(&record.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    segment_id = %record.id,
                    local_path = %record.local_path,
                    error = %e,
                    "Failed to delete segment file"
                );
                return Ok(false);
            }
        }
        match self.store.mark_cleaned(&record.id).await {
            Ok(_) => Ok(true),
            Err(StoreError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
