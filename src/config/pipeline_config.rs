//! Pipeline configuration parsing from environment variables.
//!
//! Every policy constant of the prediction pipeline (staleness, retries,
//! cache lifetime, concurrency, timeouts) is read here so it can be tuned
//! to the live provider without a rebuild.

use super::provider_config::{parse_u64, parse_usize};
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use anyhow::{Context, Result};
use std::env;

/// Pipeline environment configuration
#[derive(Debug, Clone)]
pub struct PipelineEnvConfig {
    // Freshness
    pub staleness_threshold_ms: u64,
    pub recent_candles: usize,

    // Market data retries
    pub fetch_max_attempts: u32,
    pub fetch_backoff_base_ms: u64,
    pub fetch_backoff_max_ms: u64,
    pub fetch_backoff_jitter: bool,

    // Prediction cache
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_bucket_secs: u64,
    pub cache_janitor_interval_secs: u64,

    // Scans
    pub scan_concurrency: usize,
    pub scan_symbol_timeout_secs: u64,
    /// Extra passes for a symbol whose model call timed out on every attempt
    pub scan_timeout_retries: u32,

    // Streaming
    pub subscriber_buffer: usize,
    pub ticker_interval_secs: u64,

    // Request defaults
    pub timeframes: Vec<Timeframe>,
    pub primary_timeframe: Timeframe,
    pub kline_limit: usize,
    pub depth_limit: usize,
    pub watchlist: Vec<Symbol>,
}

impl Default for PipelineEnvConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_ms: 120_000,
            recent_candles: 20,
            fetch_max_attempts: 3,
            fetch_backoff_base_ms: 500,
            fetch_backoff_max_ms: 8_000,
            fetch_backoff_jitter: true,
            cache_ttl_secs: 300,
            cache_max_entries: 256,
            cache_bucket_secs: 300,
            cache_janitor_interval_secs: 60,
            scan_concurrency: 5,
            scan_symbol_timeout_secs: 120,
            scan_timeout_retries: 1,
            subscriber_buffer: 64,
            ticker_interval_secs: 2,
            timeframes: vec![Timeframe::FifteenMin, Timeframe::OneHour, Timeframe::FourHour],
            primary_timeframe: Timeframe::FourHour,
            kline_limit: 100,
            depth_limit: 20,
            watchlist: ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"]
                .iter()
                .filter_map(|s| Symbol::parse(s).ok())
                .collect(),
        }
    }
}

impl PipelineEnvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let timeframes = match env::var("TIMEFRAMES") {
            Ok(raw) => Timeframe::parse_list(&raw).context("Failed to parse TIMEFRAMES")?,
            Err(_) => defaults.timeframes,
        };

        let primary_timeframe = match env::var("PRIMARY_TIMEFRAME") {
            Ok(raw) => raw
                .parse::<Timeframe>()
                .context("Failed to parse PRIMARY_TIMEFRAME")?,
            Err(_) => timeframes
                .last()
                .copied()
                .unwrap_or(defaults.primary_timeframe),
        };

        let watchlist = match env::var("WATCHLIST") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Symbol::parse)
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to parse WATCHLIST")?,
            Err(_) => defaults.watchlist,
        };

        Ok(Self {
            staleness_threshold_ms: parse_u64(
                "STALENESS_THRESHOLD_MS",
                defaults.staleness_threshold_ms,
            )?,
            recent_candles: parse_usize("CONTEXT_RECENT_CANDLES", defaults.recent_candles)?,
            fetch_max_attempts: parse_u64(
                "FETCH_MAX_ATTEMPTS",
                defaults.fetch_max_attempts as u64,
            )? as u32,
            fetch_backoff_base_ms: parse_u64(
                "FETCH_BACKOFF_BASE_MS",
                defaults.fetch_backoff_base_ms,
            )?,
            fetch_backoff_max_ms: parse_u64("FETCH_BACKOFF_MAX_MS", defaults.fetch_backoff_max_ms)?,
            fetch_backoff_jitter: env::var("FETCH_BACKOFF_JITTER")
                .unwrap_or_else(|_| "true".to_string())
                .parse::<bool>()
                .unwrap_or(true),
            cache_ttl_secs: parse_u64("CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            cache_max_entries: parse_usize("CACHE_MAX_ENTRIES", defaults.cache_max_entries)?,
            cache_bucket_secs: parse_u64("CACHE_BUCKET_SECS", defaults.cache_bucket_secs)?,
            cache_janitor_interval_secs: parse_u64(
                "CACHE_JANITOR_INTERVAL_SECS",
                defaults.cache_janitor_interval_secs,
            )?,
            scan_concurrency: parse_usize("SCAN_CONCURRENCY", defaults.scan_concurrency)?,
            scan_symbol_timeout_secs: parse_u64(
                "SCAN_SYMBOL_TIMEOUT_SECS",
                defaults.scan_symbol_timeout_secs,
            )?,
            scan_timeout_retries: parse_u64(
                "SCAN_TIMEOUT_RETRIES",
                defaults.scan_timeout_retries as u64,
            )? as u32,
            subscriber_buffer: parse_usize("SUBSCRIBER_BUFFER", defaults.subscriber_buffer)?,
            ticker_interval_secs: parse_u64(
                "TICKER_INTERVAL_SECS",
                defaults.ticker_interval_secs,
            )?,
            timeframes,
            primary_timeframe,
            kline_limit: parse_usize("KLINE_LIMIT", defaults.kline_limit)?,
            depth_limit: parse_usize("DEPTH_LIMIT", defaults.depth_limit)?,
            watchlist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineEnvConfig::default();
        assert_eq!(config.fetch_max_attempts, 3);
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.scan_concurrency, 5);
        assert_eq!(config.scan_timeout_retries, 1);
        assert_eq!(config.primary_timeframe, Timeframe::FourHour);
        assert_eq!(config.watchlist.len(), 4);
        assert_eq!(config.watchlist[0].to_string(), "BTC/USDT");
    }
}
