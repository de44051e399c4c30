use axum::{Json, extract::State};
use std::sync::Arc;

use crate::models::{HealthResponse, LatencyRange};
use crate::state::AppState;

// Configuration snapshot
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let settings = &state.settings;

    Json(HealthResponse {
        status: "ok".to_string(),
        mode: settings.mode.as_str().to_string(),
        requests_per_incoming: settings.requests_per_incoming,
        api_keys: settings.api_keys.len(),
        rate_limit: settings.rate_limit,
        latency: LatencyRange {
            min: settings.min_latency.as_millis() as u64,
            max: settings.max_latency.as_millis() as u64,
        },
        batch_size: settings.batch_size,
    })
}
