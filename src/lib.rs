//! Gateway that fans incoming requests out into downstream calls, queued and
//! dispatched in batches under a pool of rate-limited keys.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod downstream;
pub mod error;
pub mod handlers;
pub mod key_pool;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod state;

pub use config::{Args, Settings};
pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/process", post(handlers::process_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
