mod http;
mod telemetry;

use std::time::Duration;

use camrelay_core::Config;
use camrelay_db::SegmentStore;
use camrelay_storage::create_remote_storage;
use camrelay_worker::{
    BufferConfig, BufferManager, DeliveryConfig, DeliveryPool, Reconciler,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    telemetry::init();

    let config = Config::from_env()?;
    tracing::info!(
        camera_id = %config.camera_id,
        segments_dir = %config.segments_dir.display(),
        backend = ?config.storage_backend,
        "Starting camrelay"
    );

    tokio::fs::create_dir_all(&config.segments_dir).await?;
    let store = SegmentStore::connect(&config.db_path).await?;
    let remote = create_remote_storage(&config).await?;

    // Resolve interrupted state before any worker touches the store.
    let reconciler = Reconciler::new(
        store.clone(),
        remote.clone(),
        config.segments_dir.clone(),
        config.camera_id.clone(),
        config.remote_prefix.clone(),
        config.stability_window,
    );
    reconciler.run().await?;

    let buffer = BufferManager::new(
        store.clone(),
        BufferConfig {
            camera_id: config.camera_id.clone(),
            segments_dir: config.segments_dir.clone(),
            remote_prefix: config.remote_prefix.clone(),
            scan_interval: config.scan_interval,
            stability_window: config.stability_window,
            retention_minutes: config.buffer_retention_minutes,
            max_buffer_bytes: config.max_buffer_bytes,
            eviction_interval: config.eviction_interval,
            discard_failed: config.discard_failed,
            record_retention_days: config.record_retention_days,
        },
    );
    let backpressure = buffer.backpressure_flag();
    let buffer_handle = buffer.spawn();

    let pool = DeliveryPool::spawn(
        store.clone(),
        remote,
        DeliveryConfig {
            workers: config.upload_workers,
            claim_batch_size: config.claim_batch_size,
            upload_timeout: config.upload_timeout,
            max_attempts: config.max_upload_attempts,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            retry_jitter_ratio: config.retry_jitter_ratio,
            poll_interval: config.poll_interval,
        },
    );

    if config.reconcile_interval_secs > 0 {
        let interval = Duration::from_secs(config.reconcile_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // immediate first tick already covered at startup
            loop {
                tick.tick().await;
                if let Err(e) = reconciler.run().await {
                    tracing::error!(error = %e, "Periodic reconciliation failed");
                }
            }
        });
    }

    if config.server_enabled {
        let router = http::router(http::AppState {
            store: store.clone(),
            backpressure,
            max_buffer_bytes: config.max_buffer_bytes,
        });
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "HTTP server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "HTTP server exited");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    pool.shutdown().await;
    buffer_handle.shutdown().await;
    // In-flight uploads either finish or are reverted by the next startup's
    // reconciler; nothing to wait for here.
    Ok(())
}
