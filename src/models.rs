use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// Per-call result reported back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Error,
}

// Queued work item - holds the one-time channel used to report its outcome
pub struct QueueEntry {
    pub response_tx: oneshot::Sender<CallOutcome>,
}

// POST /process response format
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub results: Vec<CallOutcome>,
    pub processing_time: u64,
    pub request_count: usize,
    pub timestamp: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LatencyRange {
    pub min: u64,
    pub max: u64,
}

// GET /health response format
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub mode: String,
    pub requests_per_incoming: usize,
    pub api_keys: usize,
    pub rate_limit: u32,
    pub latency: LatencyRange,
    pub batch_size: usize,
}
