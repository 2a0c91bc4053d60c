//! Chainsight CLI
//!
//! One-shot predictions, batch scans and a live event tail on top of the
//! same pipeline the server runs.
//!
//! # Usage
//! ```sh
//! MODE=mock cargo run -- predict BTC --timeframes 1h,4h
//! cargo run -- scan --symbols BTC,ETH,SOL
//! cargo run -- watch --symbol BTC --seconds 120
//! ```

use anyhow::{Context, Result};
use chainsight::application::pipeline::PredictionUpdate;
use chainsight::application::streaming::Topic;
use chainsight::application::system::{Application, SystemHandle};
use chainsight::config::Config;
use chainsight::domain::analysis::prediction::{PredictionParams, PredictionResult, RiskProfile};
use chainsight::domain::market::{Symbol, Timeframe};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(author, version, about = "LLM-assisted crypto market analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct RequestArgs {
    /// Comma-separated timeframes (e.g. 15m,1h,4h); defaults to TIMEFRAMES
    #[arg(long)]
    timeframes: Option<String>,

    /// Timeframe the strategy is anchored on
    #[arg(long)]
    primary: Option<String>,

    /// conservative, moderate or aggressive
    #[arg(long, default_value = "moderate")]
    risk: String,

    /// Model override
    #[arg(long)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a prediction for one symbol
    Predict {
        /// Symbol (BTC, ETHUSDT, SOL/USDT)
        symbol: String,

        #[command(flatten)]
        request: RequestArgs,

        /// Print only the final result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Predict several symbols concurrently and print a report
    Scan {
        /// Comma-separated list of symbols; defaults to WATCHLIST
        #[arg(short, long)]
        symbols: Option<String>,

        #[command(flatten)]
        request: RequestArgs,
    },
    /// Print live events (tickers, alerts, predictions)
    Watch {
        /// Only events about this symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Stop after this many seconds; runs until Ctrl+C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn request_params(defaults: PredictionParams, args: &RequestArgs) -> Result<PredictionParams> {
    let mut params = defaults.with_risk_profile(RiskProfile::from_str(&args.risk)?);
    if let Some(list) = &args.timeframes {
        params = params.with_timeframes(Timeframe::parse_list(list)?);
    }
    if let Some(primary) = &args.primary {
        params = params.with_primary(Timeframe::from_str(primary)?);
    }
    if let Some(model) = &args.model {
        params = params.with_model(model.clone());
    }
    Ok(params)
}

fn parse_symbols(list: &str) -> Result<Vec<Symbol>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Symbol::parse(s).with_context(|| format!("Invalid symbol '{}'", s)))
        .collect()
}

fn print_result(result: &PredictionResult) {
    println!();
    println!("=== {} ({}) ===", result.symbol, result.model);
    if result.is_partial() {
        println!("(partial: the model stream ended early)");
    }
    match &result.strategy {
        Some(plan) => {
            println!("Direction:  {:?} / {:?}", plan.direction, plan.signal);
            println!("Confidence: {}%", plan.confidence);
            if let Some(zone) = &plan.entry_zone {
                println!("Entry:      {:.4} - {:.4}", zone.low, zone.high);
            }
            if let Some(sl) = plan.stop_loss {
                println!("Stop loss:  {:.4}", sl);
            }
            for (i, tp) in plan.take_profit.iter().enumerate() {
                println!("TP{}:        {:.4}", i + 1, tp);
            }
            println!("Risk:       {:?}", plan.risk_level);
            if !plan.summary.is_empty() {
                println!("Summary:    {}", plan.summary);
            }
        }
        None => println!("No structured strategy could be extracted."),
    }
}

async fn run_predict(
    handle: &SystemHandle,
    symbol: &str,
    request: &RequestArgs,
    json: bool,
) -> Result<()> {
    let symbol = Symbol::parse(symbol).with_context(|| format!("Invalid symbol '{}'", symbol))?;
    let params = request_params(handle.default_params(), request)?;

    let mut stream = handle.predict_once(symbol, params);
    let mut stdout = std::io::stdout();
    while let Some(update) = stream.next().await {
        match update {
            PredictionUpdate::Chunk(text) => {
                if !json {
                    print!("{}", text);
                    stdout.flush().ok();
                }
            }
            PredictionUpdate::Result { result, source } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(result.as_ref())?);
                } else {
                    info!("Prediction served ({:?})", source);
                    print_result(&result);
                }
                return Ok(());
            }
            PredictionUpdate::Error(e) => anyhow::bail!("Prediction failed: {}", e),
        }
    }
    anyhow::bail!("Prediction stream ended without a result")
}

async fn run_scan(
    handle: &SystemHandle,
    config: &Config,
    symbols: Option<&str>,
    request: &RequestArgs,
) -> Result<()> {
    let symbols = match symbols {
        Some(list) => parse_symbols(list)?,
        None => config.pipeline.watchlist.clone(),
    };
    if symbols.is_empty() {
        anyhow::bail!("No symbols to scan (pass --symbols or set WATCHLIST)");
    }
    let params = request_params(handle.default_params(), request)?;

    let report = handle.scan(symbols, params).await;

    println!("\n{:<12} {:<10} {:>8}  DETAILS", "SYMBOL", "STATUS", "SECS");
    for outcome in &report.outcomes {
        let details = match &outcome.result {
            Ok(result) => result
                .strategy
                .as_ref()
                .map(|p| format!("{:?} {}%", p.direction, p.confidence))
                .unwrap_or_else(|| "no strategy".to_string()),
            Err(e) => e.to_string(),
        };
        println!(
            "{:<12} {:<10} {:>8.1}  {}",
            outcome.symbol.to_string(),
            outcome.status(),
            outcome.elapsed.as_secs_f64(),
            details
        );
    }
    println!("\n{}", serde_json::to_string(&report.summary)?);
    Ok(())
}

async fn run_watch(handle: &SystemHandle, symbol: Option<&str>, seconds: Option<u64>) -> Result<()> {
    let topic = match symbol {
        Some(s) => Topic::Symbol(Symbol::parse(s).with_context(|| format!("Invalid symbol '{}'", s))?),
        None => Topic::Global,
    };
    let mut subscription = handle.subscribe(topic);
    let deadline = tokio::time::sleep(Duration::from_secs(seconds.unwrap_or(86_400 * 365)));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => {
                    warn!("Subscription closed (consumer too slow)");
                    break;
                }
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays machine-readable
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stderr_layer)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    // The CLI runs one request at a time and has no use for the periodic reporter
    config.observability.enabled = false;
    if !matches!(cli.command, Commands::Watch { .. }) {
        config.pipeline.watchlist.clear();
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            warn!("Configuration: {}", problem);
        }
        anyhow::bail!("Invalid configuration ({} problems)", problems.len());
    }

    let app = Application::build(config.clone()).await?;
    let handle = app.start();

    let outcome = match &cli.command {
        Commands::Predict {
            symbol,
            request,
            json,
        } => run_predict(&handle, symbol, request, *json).await,
        Commands::Scan { symbols, request } => {
            run_scan(&handle, &config, symbols.as_deref(), request).await
        }
        Commands::Watch { symbol, seconds } => {
            run_watch(&handle, symbol.as_deref(), *seconds).await
        }
    };

    handle.shutdown().await;
    outcome
}
