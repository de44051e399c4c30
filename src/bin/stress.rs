use clap::Parser;
use futures::future::join_all;
use std::time::{Duration, Instant};

use keypool_gateway::models::{HealthResponse, ProcessResponse};

// Stress test client for a running gateway
#[derive(Parser, Debug)]
#[command(name = "stress")]
#[command(about = "Fire concurrent /process requests at a running gateway")]
struct Args {
    // Number of concurrent /process requests
    #[arg(long, env = "CONCURRENT_REQUESTS", default_value_t = 100)]
    concurrent_requests: usize,

    // Port the gateway listens on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    // Print one line per request, anything but "false" turns it on
    #[arg(
        long,
        env = "DETAILED_LOGS",
        default_value = "true",
        value_parser = parse_detailed_logs,
        action = clap::ArgAction::Set
    )]
    detailed_logs: bool,

    // Per-request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 60000)]
    request_timeout: u64,
}

fn parse_detailed_logs(value: &str) -> Result<bool, std::convert::Infallible> {
    Ok(value != "false")
}

enum RequestReport {
    Success {
        request_id: usize,
        response_count: usize,
        processing_time: Duration,
    },
    Failed {
        request_id: usize,
        error: String,
    },
}

async fn send_one(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    request_id: usize,
) -> RequestReport {
    let started = Instant::now();
    let result = async {
        client
            .post(url)
            .json(&serde_json::json!({}))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<ProcessResponse>()
            .await
    }
    .await;

    match result {
        Ok(body) => RequestReport::Success {
            request_id,
            response_count: body.results.len(),
            processing_time: started.elapsed(),
        },
        Err(e) => RequestReport::Failed {
            request_id,
            error: e.to_string(),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let base_url = format!("http://localhost:{}", args.port);
    let client = reqwest::Client::new();

    println!(
        "Starting stress test with {} concurrent requests...",
        args.concurrent_requests
    );

    let health = match client.get(format!("{base_url}/health")).send().await {
        Ok(res) => res.json::<HealthResponse>().await?,
        Err(_) => {
            eprintln!("Error connecting to server. Is it running?");
            return Ok(());
        }
    };
    println!("Server configuration: {}", serde_json::to_string_pretty(&health)?);
    println!(
        "Each request will trigger {} third-party API calls",
        health.requests_per_incoming
    );

    let url = format!("{base_url}/process");
    let timeout = Duration::from_millis(args.request_timeout);
    let start = Instant::now();

    let reports = join_all(
        (1..=args.concurrent_requests).map(|id| send_one(&client, &url, timeout, id)),
    )
    .await;

    let total_time = start.elapsed();

    let times: Vec<Duration> = reports
        .iter()
        .filter_map(|r| match r {
            RequestReport::Success {
                processing_time, ..
            } => Some(*processing_time),
            RequestReport::Failed { .. } => None,
        })
        .collect();
    let failed = reports.len() - times.len();

    if times.is_empty() {
        println!("\nALL REQUESTS FAILED");
        if let Some(RequestReport::Failed { error, .. }) = reports.first() {
            println!("First error: {error}");
        }
        return Ok(());
    }

    let avg_ms = times.iter().map(|t| t.as_secs_f64() * 1000.0).sum::<f64>() / times.len() as f64;
    let min = times.iter().min().copied().unwrap_or_default();
    let max = times.iter().max().copied().unwrap_or_default();

    println!("\n========== STRESS TEST RESULTS ==========");
    println!(
        "Total test time: {}ms ({:.2}s)",
        total_time.as_millis(),
        total_time.as_secs_f64()
    );
    println!("Successful requests: {}/{}", times.len(), args.concurrent_requests);
    println!("Failed requests: {}/{}", failed, args.concurrent_requests);
    println!("Average processing time: {avg_ms:.2}ms");
    println!("Fastest request: {}ms", min.as_millis());
    println!("Slowest request: {}ms", max.as_millis());

    let total_calls: usize = reports
        .iter()
        .map(|r| match r {
            RequestReport::Success { response_count, .. } => *response_count,
            RequestReport::Failed { .. } => 0,
        })
        .sum();
    println!("Total API calls processed: {total_calls}");
    println!(
        "Throughput: {:.2} API calls per second",
        total_calls as f64 / total_time.as_secs_f64()
    );

    if args.detailed_logs {
        println!("\n========== INDIVIDUAL REQUEST TIMES ==========");
        for report in &reports {
            match report {
                RequestReport::Success {
                    request_id,
                    response_count,
                    processing_time,
                } => println!(
                    "Request #{request_id}: {}ms, {response_count} responses",
                    processing_time.as_millis()
                ),
                RequestReport::Failed { request_id, error } => {
                    println!("Request #{request_id}: FAILED - {error}")
                }
            }
        }
    }

    Ok(())
}
