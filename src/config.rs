use clap::Parser;
use std::time::Duration;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "keypool-gateway")]
#[command(about = "Rate-limited key pool gateway with batched dispatch")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    // Test mode uses the small request counts and latencies
    #[arg(long, env = "TEST_MODE", default_value_t = false, action = clap::ArgAction::Set)]
    pub test_mode: bool,

    // Downstream calls generated per incoming request
    #[arg(long, env = "TEST_REQUESTS_COUNT", default_value_t = 50)]
    pub test_requests_count: usize,

    #[arg(long, env = "PROD_REQUESTS_COUNT", default_value_t = 2000)]
    pub prod_requests_count: usize,

    // Simulated downstream latency bounds in milliseconds
    #[arg(long, env = "TEST_MIN_LATENCY", default_value_t = 10)]
    pub test_min_latency: u64,

    #[arg(long, env = "TEST_MAX_LATENCY", default_value_t = 50)]
    pub test_max_latency: u64,

    #[arg(long, env = "PROD_MIN_LATENCY", default_value_t = 500)]
    pub prod_min_latency: u64,

    #[arg(long, env = "PROD_MAX_LATENCY", default_value_t = 3000)]
    pub prod_max_latency: u64,

    // Key acquisitions allowed per key per 60 second window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 1000)]
    pub rate_limit: u32,

    // Keys (comma-separated)
    // Example: "key1,key2,key3"
    #[arg(long, env = "API_KEYS", default_value = "key1,key2,key3")]
    pub api_keys: String,

    // Queued entries dispatched under one key acquisition
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    pub batch_size: usize,

    // Backlog bound, 0 means unbounded
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 0)]
    pub queue_capacity: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one API key is required")]
    NoKeys,

    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("Minimum latency ({min}ms) is greater than maximum latency ({max}ms)")]
    LatencyRange { min: u64, max: u64 },

    #[error("Queue capacity ({capacity}) cannot hold the {requests} calls of one incoming request")]
    CapacityBelowRequestCount { capacity: usize, requests: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Test,
    FullScale,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Test => "test",
            Mode::FullScale => "full-scale",
        }
    }
}

/// Configuration with the mode-dependent values already resolved.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub mode: Mode,
    pub requests_per_incoming: usize,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub rate_limit: u32,
    pub api_keys: Vec<String>,
    pub batch_size: usize,
    pub queue_capacity: Option<usize>,
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let (mode, requests, min, max) = if args.test_mode {
            (
                Mode::Test,
                args.test_requests_count,
                args.test_min_latency,
                args.test_max_latency,
            )
        } else {
            (
                Mode::FullScale,
                args.prod_requests_count,
                args.prod_min_latency,
                args.prod_max_latency,
            )
        };

        let api_keys = parse_keys(&args.api_keys);
        if api_keys.is_empty() {
            return Err(ConfigError::NoKeys);
        }
        if args.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if min > max {
            return Err(ConfigError::LatencyRange { min, max });
        }
        if args.queue_capacity > 0 && args.queue_capacity < requests {
            return Err(ConfigError::CapacityBelowRequestCount {
                capacity: args.queue_capacity,
                requests,
            });
        }

        Ok(Self {
            port: args.port,
            mode,
            requests_per_incoming: requests,
            min_latency: Duration::from_millis(min),
            max_latency: Duration::from_millis(max),
            rate_limit: args.rate_limit,
            api_keys,
            batch_size: args.batch_size,
            queue_capacity: (args.queue_capacity > 0).then_some(args.queue_capacity),
        })
    }
}

// "key1, key2,,key3" -> ["key1", "key2", "key3"]
pub fn parse_keys(keys_str: &str) -> Vec<String> {
    keys_str
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Every flag spelled out, so ambient environment variables never leak into tests
#[cfg(test)]
pub(crate) fn test_args(overrides: &[(&str, &str)]) -> Args {
    let mut flags = vec![
        ("--port", "3000"),
        ("--test-mode", "false"),
        ("--test-requests-count", "50"),
        ("--prod-requests-count", "2000"),
        ("--test-min-latency", "10"),
        ("--test-max-latency", "50"),
        ("--prod-min-latency", "500"),
        ("--prod-max-latency", "3000"),
        ("--rate-limit", "1000"),
        ("--api-keys", "key1,key2,key3"),
        ("--batch-size", "10"),
        ("--queue-capacity", "0"),
    ];
    for (flag, value) in overrides {
        match flags.iter_mut().find(|(name, _)| *name == *flag) {
            Some(entry) => entry.1 = *value,
            None => panic!("unknown flag {flag}"),
        }
    }

    let mut argv = vec!["keypool-gateway"];
    for (flag, value) in flags {
        argv.push(flag);
        argv.push(value);
    }
    Args::try_parse_from(argv).expect("args should parse")
}
