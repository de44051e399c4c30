use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("keypool_requests_total", "Total number of incoming process requests")
            .expect("metric can be registered");
    pub static ref CALLS_SUBMITTED: Counter =
        register_counter!("keypool_calls_submitted_total", "Total downstream calls queued")
            .expect("metric can be registered");
    pub static ref BATCHES_DISPATCHED: Counter =
        register_counter!("keypool_batches_dispatched_total", "Total batches dispatched under a key")
            .expect("metric can be registered");
    pub static ref KEY_WAITS: Counter =
        register_counter!("keypool_key_waits_total", "Times the drain loop waited for a key window")
            .expect("metric can be registered");
    pub static ref CALL_FAILURES: Counter =
        register_counter!("keypool_call_failures_total", "Downstream calls resolved as error")
            .expect("metric can be registered");
    pub static ref BACKLOG_DEPTH: Gauge =
        register_gauge!("keypool_backlog_depth", "Entries waiting in the backlog")
            .expect("metric can be registered");
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "keypool_request_latency_seconds",
        "Process request latency in seconds"
    )
    .expect("metric can be registered");
}

// Render all registered metrics in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
