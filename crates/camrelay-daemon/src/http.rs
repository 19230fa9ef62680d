//! Read-only HTTP surface: pipeline health and the buffered segment list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use camrelay_core::HealthReport;
use camrelay_db::SegmentStore;

#[derive(Clone)]
pub struct AppState {
    pub store: SegmentStore,
    pub backpressure: Arc<AtomicBool>,
    pub max_buffer_bytes: i64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/segments", get(segments))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = match build_report(&state).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Health query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "store unavailable" })),
            );
        }
    };

    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!(report)))
}

async fn build_report(state: &AppState) -> anyhow::Result<HealthReport> {
    let counts = state.store.counts_by_state().await?;
    let oldest_pending = state.store.oldest_pending_created_at().await?;
    let last_segment_at = state.store.newest_created_at().await?;
    let total_buffer_bytes = state.store.total_buffer_bytes().await?;
    Ok(HealthReport::evaluate(
        counts,
        oldest_pending,
        last_segment_at,
        total_buffer_bytes,
        state.max_buffer_bytes,
        state.backpressure.load(Ordering::Relaxed),
    ))
}

/// Buffered segments in chronological order, for playback tooling.
async fn segments(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_buffered().await {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!(records))),
        Err(e) => {
            tracing::error!(error = %e, "Segment list query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "store unavailable" })),
            )
        }
    }
}
