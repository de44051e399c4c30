use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use keypool_gateway::{AppState, Args, Settings, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keypool_gateway=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // parse cli arguments / environment
    let args = Args::parse();
    let settings = Settings::from_args(&args)?;

    let state = Arc::new(AppState::new(settings.clone())?);
    let app = router(state.clone());

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server running at http://localhost:{}", settings.port);
    info!(mode = settings.mode.as_str(), "Running in {} mode", settings.mode.as_str());
    info!("Requests per incoming call: {}", settings.requests_per_incoming);
    info!(
        "API latency: {}-{}ms",
        settings.min_latency.as_millis(),
        settings.max_latency.as_millis()
    );
    info!("Rate limit: {} requests per minute per key", settings.rate_limit);
    info!("API keys: {}", settings.api_keys.len());
    info!("Batch size: {}", settings.batch_size);
    match settings.queue_capacity {
        Some(max) => info!("Queue capacity: {}", max),
        None => info!("Queue capacity: unbounded"),
    }

    let queue = state.queue.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
            queue.shutdown();
        })
        .await?;

    Ok(())
}
