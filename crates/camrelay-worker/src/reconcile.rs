//! Startup reconciler: re-aligns the segment store with the segments
//! directory and the remote store after a crash or unclean shutdown.
//!
//! Runs before any worker starts, so it is the only writer while it runs.
//! Reconciliation is idempotent: a second run over an unchanged system
//! performs no transitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use camrelay_core::models::segment::{parse_capture_start, segment_id};
use camrelay_core::{DataIntegrityError, NewSegment, SegmentState, StoreError};
use camrelay_db::SegmentStore;
use camrelay_storage::{remote_key, RemoteStorage};

use crate::checksum::sha256_file;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// On-disk files with no record, registered as created.
    pub registered: usize,
    /// Interrupted uploads confirmed present remotely.
    pub confirmed_uploaded: usize,
    /// Interrupted uploads returned to the retry queue.
    pub requeued: usize,
    /// Uploaded/failed records whose file was already gone; cleanup finished.
    pub cleanup_completed: usize,
    /// Pending records whose file vanished before delivery.
    pub data_loss: usize,
    /// Records whose file no longer matches its size or checksum.
    pub corrupt: usize,
}

impl ReconcileSummary {
    pub fn changed(&self) -> bool {
        *self != ReconcileSummary::default()
    }
}

pub struct Reconciler {
    store: SegmentStore,
    remote: Arc<dyn RemoteStorage>,
    segments_dir: PathBuf,
    camera_id: String,
    remote_prefix: String,
    /// Files modified more recently than this are assumed still being written.
    stability_window: Duration,
}

impl Reconciler {
    pub fn new(
        store: SegmentStore,
        remote: Arc<dyn RemoteStorage>,
        segments_dir: PathBuf,
        camera_id: String,
        remote_prefix: String,
        stability_window: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            segments_dir,
            camera_id,
            remote_prefix,
            stability_window,
        }
    }

    pub async fn run(&self) -> anyhow::Result<ReconcileSummary> {
        let start = std::time::Instant::now();
        let mut summary = ReconcileSummary::default();

        for record in self.store.list_active().await? {
            let path = PathBuf::from(&record.local_path);
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => Some(metadata),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };

            match metadata {
                None => match record.state {
                    // Remote delivery (or terminal failure) already resolved
                    // the segment; only the cleanup step was interrupted.
                    SegmentState::Uploaded | SegmentState::Failed => {
                        self.store.mark_cleaned(&record.id).await?;
                        summary.cleanup_completed += 1;
                    }
                    _ => {
                        let finding = DataIntegrityError::DataLossDetected {
                            id: record.id.clone(),
                        };
                        tracing::error!(
                            segment_id = %record.id,
                            local_path = %record.local_path,
                            state = %record.state,
                            error = %finding,
                            "Segment file lost before delivery"
                        );
                        // No file remains, so the failed record goes straight
                        // to cleaned; the error text survives for operators.
                        self.store.mark_failed(&record.id, &finding.to_string()).await?;
                        self.store.mark_cleaned(&record.id).await?;
                        summary.data_loss += 1;
                    }
                },
                Some(metadata) => {
                    if record.state.is_pending()
                        && !self.verify(&record, metadata.len()).await?
                    {
                        summary.corrupt += 1;
                        continue;
                    }
                    if record.state == SegmentState::Uploading {
                        self.resolve_interrupted(&record, &mut summary).await?;
                    }
                }
            }
        }

        summary.registered = self.register_orphans().await?;

        if summary.changed() {
            tracing::info!(
                registered = summary.registered,
                confirmed_uploaded = summary.confirmed_uploaded,
                requeued = summary.requeued,
                cleanup_completed = summary.cleanup_completed,
                data_loss = summary.data_loss,
                corrupt = summary.corrupt,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Reconciliation complete"
            );
        } else {
            tracing::info!(
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Reconciliation complete, store consistent"
            );
        }
        Ok(summary)
    }

    /// Check a pending record's file against its recorded size and checksum.
    /// A mismatch is marked failed without attempting delivery.
    async fn verify(
        &self,
        record: &camrelay_core::SegmentRecord,
        actual_size: u64,
    ) -> anyhow::Result<bool> {
        let detail = if actual_size as i64 != record.size_bytes {
            Some(format!(
                "size changed after registration: recorded {}, found {}",
                record.size_bytes, actual_size
            ))
        } else {
            let actual = sha256_file(Path::new(&record.local_path)).await?;
            if actual != record.checksum {
                Some("checksum mismatch after registration".to_string())
            } else {
                None
            }
        };

        match detail {
            None => Ok(true),
            Some(detail) => {
                let finding = DataIntegrityError::CorruptSegment {
                    id: record.id.clone(),
                    detail,
                };
                tracing::error!(
                    segment_id = %record.id,
                    local_path = %record.local_path,
                    error = %finding,
                    "Corrupt segment detected"
                );
                self.store.mark_failed(&record.id, &finding.to_string()).await?;
                Ok(false)
            }
        }
    }

    /// A record left in uploading means the process died mid-attempt. The
    /// remote store decides whether the attempt actually completed.
    async fn resolve_interrupted(
        &self,
        record: &camrelay_core::SegmentRecord,
        summary: &mut ReconcileSummary,
    ) -> anyhow::Result<()> {
        let delivered = match self.remote.exists(&record.remote_key).await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::warn!(
                    segment_id = %record.id,
                    error = %e,
                    "Could not confirm interrupted upload, re-queueing"
                );
                false
            }
        };

        if delivered {
            self.store.mark_uploaded(&record.id).await?;
            summary.confirmed_uploaded += 1;
            tracing::info!(
                segment_id = %record.id,
                remote_key = %record.remote_key,
                "Interrupted upload confirmed delivered"
            );
        } else {
            self.store.requeue_interrupted(&record.id).await?;
            summary.requeued += 1;
        }
        Ok(())
    }

    /// Register stable on-disk segment files the store has never seen.
    async fn register_orphans(&self) -> anyhow::Result<usize> {
        let mut registered = 0;
        let mut dir = tokio::fs::read_dir(&self.segments_dir).await?;

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
            // Skip a file the capture process may still be writing.
            if let Ok(modified) = metadata.modified() {
                if modified.elapsed().unwrap_or_default() < self.stability_window {
                    continue;
                }
            }

            let path_str = path.to_string_lossy().into_owned();
            if self.store.get_by_local_path(&path_str).await?.is_some() {
                continue;
            }

            let checksum = sha256_file(&path).await?;
            let segment = NewSegment {
                id: segment_id(&self.camera_id, started_at, sequence),
                camera_id: self.camera_id.clone(),
                local_path: path_str,
                remote_key: remote_key(&self.remote_prefix, &self.camera_id, started_at, name),
                size_bytes: metadata.len() as i64,
                checksum,
                created_at: started_at,
            };
            match self.store.register(segment).await {
                Ok(record) => {
                    tracing::info!(
                        segment_id = %record.id,
                        local_path = %record.local_path,
                        "Recovered untracked segment file"
                    );
                    registered += 1;
                }
                Err(StoreError::DuplicateSegment { id }) => {
                    tracing::debug!(segment_id = %id, "Segment already tracked");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(registered)
    }
}
