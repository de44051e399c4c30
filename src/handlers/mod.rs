mod health;
mod metrics;
mod process;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use process::process_handler;
