//! Configuration module for Chainsight.
//!
//! This module provides structured configuration loading from environment variables,
//! organized by domain: Providers, Pipeline, and Observability.

mod observability_config;
mod pipeline_config;
mod provider_config;

pub use observability_config::ObservabilityEnvConfig;
pub use pipeline_config::PipelineEnvConfig;
pub use provider_config::{BinanceConfig, LlmConfig, ProviderEnvConfig};

use crate::application::analysis::context_aggregator::AggregatorConfig;
use crate::application::cache::prediction_cache::CacheConfig;
use crate::application::concurrency::RetryPolicy;
use crate::application::inference::inference_client::InferenceConfig;
use crate::application::scan::scan_coordinator::ScanConfig;
use crate::domain::analysis::prediction::PredictionParams;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Deterministic in-process providers, no network
    Mock,
    /// Binance market data and a remote language model
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock' or 'live'", s),
        }
    }
}

/// Main application configuration.
///
/// Aggregates the sub-configs and converts them into the typed settings
/// each pipeline component is constructed with.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub providers: ProviderEnvConfig,
    pub pipeline: PipelineEnvConfig,
    pub observability: ObservabilityEnvConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Mock,
            providers: ProviderEnvConfig::default(),
            pipeline: PipelineEnvConfig::default(),
            observability: ObservabilityEnvConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mode_str = env::var("MODE").unwrap_or_else(|_| "mock".to_string());
        let mode = Mode::from_str(&mode_str)?;

        let providers = ProviderEnvConfig::from_env().context("Failed to load provider config")?;
        let pipeline = PipelineEnvConfig::from_env().context("Failed to load pipeline config")?;
        let observability = ObservabilityEnvConfig::from_env();

        Ok(Self {
            mode,
            providers,
            pipeline,
            observability,
        })
    }

    /// Returns the list of problems that would prevent the system from running
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.mode == Mode::Live && self.providers.llm.api_key.is_empty() {
            problems.push("LLM_API_KEY (or DEEPSEEK_API_KEY) is not set".to_string());
        }
        if self.pipeline.timeframes.is_empty() {
            problems.push("TIMEFRAMES must name at least one timeframe".to_string());
        }
        if self.pipeline.fetch_max_attempts == 0 {
            problems.push("FETCH_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.pipeline.scan_concurrency == 0 {
            problems.push("SCAN_CONCURRENCY must be at least 1".to_string());
        }
        if self.pipeline.subscriber_buffer == 0 {
            problems.push("SUBSCRIBER_BUFFER must be at least 1".to_string());
        }
        if self.providers.binance.max_concurrent_requests == 0
            || self.providers.llm.max_concurrent_requests == 0
        {
            problems.push("provider concurrency limits must be at least 1".to_string());
        }

        problems
    }

    /// Create the market-data retry policy from this Config
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.pipeline.fetch_max_attempts.max(1),
            base_delay: Duration::from_millis(self.pipeline.fetch_backoff_base_ms),
            max_delay: Duration::from_millis(self.pipeline.fetch_backoff_max_ms),
            jitter: self.pipeline.fetch_backoff_jitter,
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            staleness_threshold: Duration::from_millis(self.pipeline.staleness_threshold_ms),
            recent_candles: self.pipeline.recent_candles,
        }
    }

    pub fn inference_config(&self) -> InferenceConfig {
        let llm = &self.providers.llm;
        InferenceConfig {
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            open_timeout: Duration::from_millis(llm.open_timeout_ms),
            idle_timeout: Duration::from_millis(llm.idle_timeout_ms),
            timeout_retries: llm.timeout_retries,
            ..InferenceConfig::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.pipeline.cache_ttl_secs),
            max_entries: self.pipeline.cache_max_entries,
            bucket_width: Duration::from_secs(self.pipeline.cache_bucket_secs),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            concurrency: self.pipeline.scan_concurrency.max(1),
            symbol_timeout: Duration::from_secs(self.pipeline.scan_symbol_timeout_secs),
            timeout_retries: self.pipeline.scan_timeout_retries,
        }
    }

    /// Request parameters used when a caller does not supply its own
    pub fn default_params(&self) -> PredictionParams {
        let mut params = PredictionParams::default()
            .with_timeframes(self.pipeline.timeframes.iter().copied())
            .with_primary(self.pipeline.primary_timeframe)
            .with_kline_limit(self.pipeline.kline_limit);
        params.depth_limit = self.pipeline.depth_limit;
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::timeframe::Timeframe;

    #[test]
    fn test_mode_from_str() {
        assert_eq!(Mode::from_str("MOCK").unwrap(), Mode::Mock);
        assert_eq!(Mode::from_str("live").unwrap(), Mode::Live);
        assert!(Mode::from_str("paper").is_err());
    }

    #[test]
    fn test_live_mode_requires_llm_key() {
        let mut config = Config {
            mode: Mode::Live,
            ..Config::default()
        };
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("LLM_API_KEY"));

        config.providers.llm.api_key = "sk-test".to_string();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_mock_mode_needs_no_keys() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn test_conversions() {
        let config = Config::default();
        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(500));

        let cache = config.cache_config();
        assert_eq!(cache.ttl, Duration::from_secs(300));

        let params = config.default_params();
        assert_eq!(params.primary_timeframe, Timeframe::FourHour);
        assert_eq!(params.timeframes().len(), 3);
    }
}
