//! Chainsight Server - Headless prediction service
//!
//! Runs the pipeline with its background services (cache janitor, ticker
//! feed, metrics reporter) and periodically refreshes predictions for the
//! watchlist. Events are logged as they are broadcast; metrics are pushed
//! via structured JSON logs to stdout.
//!
//! # Usage
//! ```sh
//! MODE=live WATCHLIST=BTC,ETH OBSERVABILITY_INTERVAL=60 cargo run --bin server
//! ```
//!
//! # Environment Variables
//! - `OBSERVABILITY_ENABLED` - Enable metrics reporting (default: true)
//! - `OBSERVABILITY_INTERVAL` - Interval in seconds between metric outputs (default: 60)
//! - `SCAN_INTERVAL_SECS` - Interval between watchlist scans, 0 disables them (default: 900)

use anyhow::Result;
use chainsight::application::streaming::{StreamEvent, Topic};
use chainsight::application::system::Application;
use chainsight::config::Config;
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Chainsight Server {} starting...", env!("CARGO_PKG_VERSION"));
    info!("Metrics: Push-based (JSON to stdout)");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: Mode={:?}, Watchlist={:?}, Timeframes={:?}",
        config.mode,
        config
            .pipeline
            .watchlist
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>(),
        config.pipeline.timeframes
    );

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("Configuration: {}", problem);
        }
        anyhow::bail!("Invalid configuration ({} problems)", problems.len());
    }

    let app = Application::build(config.clone()).await?;
    let handle = app.start();
    info!("Prediction system running.");

    // Event log
    let mut events = handle.subscribe(Topic::Global);
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                StreamEvent::PredictionChunk { .. } | StreamEvent::TickerUpdate { .. } => {
                    debug!("Event: {}", event.kind())
                }
                StreamEvent::MarketAlert(alert) => warn!("Alert: {}", alert.message),
                StreamEvent::PredictionFailed {
                    symbol,
                    kind,
                    message,
                } => warn!("Prediction failed for {} ({}): {}", symbol, kind, message),
                _ => match serde_json::to_string(&event) {
                    Ok(json) => info!("EVENT_JSON: {}", json),
                    Err(e) => error!("Failed to serialize event: {}", e),
                },
            }
        }
        warn!("Event log subscription closed");
    });

    let scan_interval = std::env::var("SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(900);
    let watchlist = config.pipeline.watchlist.clone();

    info!("Server running. Press Ctrl+C to shutdown.");
    if scan_interval == 0 || watchlist.is_empty() {
        info!("Periodic scans disabled.");
        tokio::signal::ctrl_c().await?;
    } else {
        info!(
            "Scanning {} symbols every {}s",
            watchlist.len(),
            scan_interval
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(scan_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = handle.scan(watchlist.clone(), handle.default_params()).await;
                    info!(
                        "Scan {} finished: {}/{} ok, {} cached, {} failed in {}ms",
                        report.scan_id,
                        report.summary.succeeded,
                        report.summary.total,
                        report.summary.cached,
                        report.summary.failed,
                        report.summary.elapsed_ms
                    );
                }
                result = tokio::signal::ctrl_c() => {
                    result?;
                    break;
                }
            }
        }
    }

    info!("Shutdown signal received. Exiting...");
    handle.shutdown().await;
    event_log.abort();

    Ok(())
}
