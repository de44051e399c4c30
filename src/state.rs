use std::sync::Arc;

use crate::config::Settings;
use crate::downstream::{Downstream, SimulatedApi};
use crate::key_pool::{KeyPool, KeyPoolError};
use crate::queue::{DispatchQueue, QueueConfig};

// app's shared state
pub struct AppState {
    pub settings: Settings,
    pub queue: DispatchQueue,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self, KeyPoolError> {
        let downstream = Arc::new(SimulatedApi::new(settings.min_latency, settings.max_latency));
        Self::with_downstream(settings, downstream)
    }

    pub fn with_downstream(
        settings: Settings,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, KeyPoolError> {
        let key_pool = KeyPool::new(settings.api_keys.clone(), settings.rate_limit)?;
        let queue = DispatchQueue::new(
            key_pool,
            downstream,
            QueueConfig {
                batch_size: settings.batch_size,
                capacity: settings.queue_capacity,
            },
        );
        Ok(Self { settings, queue })
    }
}
