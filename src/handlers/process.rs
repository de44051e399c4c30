use axum::{Json, extract::State};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ApiError;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::ProcessResponse;
use crate::state::AppState;

// Fans one incoming request out into the configured number of downstream calls
pub async fn process_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProcessResponse>, ApiError> {
    REQUEST_TOTAL.inc();

    let start_time = Instant::now();
    let request_count = state.settings.requests_per_incoming;

    // all or nothing, a rejected request leaves no orphaned calls queued
    let tickets = state.queue.submit_many(request_count)?;

    let results = try_join_all(tickets).await?;

    let elapsed = start_time.elapsed();
    REQUEST_LATENCY.observe(elapsed.as_secs_f64());
    tracing::info!(
        processing_ms = elapsed.as_millis() as u64,
        request_count,
        "Request completed"
    );
    tracing::debug!(stats = ?state.queue.stats(), keys = ?state.queue.key_usage(), "Queue state");

    Ok(Json(ProcessResponse {
        results,
        processing_time: elapsed.as_millis() as u64,
        request_count,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}
