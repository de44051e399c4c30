use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::models::CallOutcome;

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("Request failed: {0}")]
    Request(String),
}

/// The service work is forwarded to. One call per queued entry, made with
/// the key granted to the entry's batch.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn call(&self, key: &str) -> Result<CallOutcome, DownstreamError>;
}

// Stand-in for a third party API, answers after a random delay
#[derive(Debug, Clone)]
pub struct SimulatedApi {
    min_latency: Duration,
    max_latency: Duration,
}

impl SimulatedApi {
    pub fn new(min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            min_latency,
            max_latency,
        }
    }

    fn next_delay(&self) -> Duration {
        if self.max_latency <= self.min_latency {
            return self.min_latency;
        }
        rand::rng().random_range(self.min_latency..=self.max_latency)
    }
}

#[async_trait]
impl Downstream for SimulatedApi {
    async fn call(&self, key: &str) -> Result<CallOutcome, DownstreamError> {
        let delay = self.next_delay();
        tracing::trace!(key, delay_ms = delay.as_millis() as u64, "Simulated call");
        tokio::time::sleep(delay).await;
        Ok(CallOutcome::Success)
    }
}
