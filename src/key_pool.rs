use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyPoolError {
    #[error("At least one key required")]
    Empty,
}

// Single key with its usage in the current window
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key: String,
    pub usage_count: u32,
    pub window_reset_at: Instant,
}

/// Result of a selection attempt. `key` is `None` when every key is at its
/// quota, in which case `wait` is the time until the least-used key resets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub key: Option<String>,
    pub wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUsage {
    pub key: String,
    pub usage_count: u32,
    pub resets_in_ms: u64,
}

// Pool of keys, each with its own lazily reset window.
// `records` is never empty, `with_window` refuses an empty key list.
#[derive(Debug)]
pub struct KeyPool {
    records: Vec<KeyRecord>,
    quota: u32,
    window: Duration,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, quota: u32) -> Result<Self, KeyPoolError> {
        Self::with_window(keys, quota, DEFAULT_WINDOW, Instant::now())
    }

    pub fn with_window(
        keys: Vec<String>,
        quota: u32,
        window: Duration,
        now: Instant,
    ) -> Result<Self, KeyPoolError> {
        if keys.is_empty() {
            return Err(KeyPoolError::Empty);
        }

        let records = keys
            .into_iter()
            .map(|key| KeyRecord {
                key,
                usage_count: 0,
                window_reset_at: now + window,
            })
            .collect();

        Ok(Self {
            records,
            quota,
            window,
        })
    }

    pub fn select_key(&mut self) -> Selection {
        self.select_key_at(Instant::now())
    }

    /// Grants the least-used key and charges one unit of its quota.
    ///
    /// Windows whose deadline has been reached are reset first. Ties go to
    /// the key registered first.
    pub fn select_key_at(&mut self, now: Instant) -> Selection {
        for record in self.records.iter_mut() {
            if record.window_reset_at <= now {
                record.usage_count = 0;
                record.window_reset_at = now + self.window;
            }
        }

        // first minimum wins, which keeps pool order on ties
        let mut least = 0;
        for (index, record) in self.records.iter().enumerate().skip(1) {
            if record.usage_count < self.records[least].usage_count {
                least = index;
            }
        }
        let record = &mut self.records[least];

        if record.usage_count >= self.quota {
            return Selection {
                key: None,
                wait: record.window_reset_at.saturating_duration_since(now),
            };
        }

        record.usage_count += 1;
        Selection {
            key: Some(record.key.clone()),
            wait: Duration::ZERO,
        }
    }

    // Read-only view, does not apply pending resets
    pub fn snapshot(&self) -> Vec<KeyUsage> {
        let now = Instant::now();
        self.records
            .iter()
            .map(|r| KeyUsage {
                key: r.key.clone(),
                usage_count: r.usage_count,
                resets_in_ms: r.window_reset_at.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }
}
