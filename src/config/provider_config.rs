//! Provider configuration parsing from environment variables.
//!
//! This module handles loading configuration for the external collaborators:
//! - Binance USD-M futures REST (market data)
//! - OpenAI-compatible chat completions (DeepSeek by default)

use anyhow::{Context, Result};
use std::env;

/// Binance market data configuration
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Concurrent outstanding requests allowed against the exchange
    pub max_concurrent_requests: usize,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://fapi.binance.com".to_string(),
            request_timeout_ms: 10_000,
            max_concurrent_requests: 5,
        }
    }
}

impl BinanceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            base_url: env::var("BINANCE_BASE_URL").unwrap_or(defaults.base_url),
            request_timeout_ms: parse_u64(
                "BINANCE_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            )?,
            max_concurrent_requests: parse_usize(
                "BINANCE_MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
        })
    }
}

/// Language-model backend configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Time allowed for the provider to accept the request and start streaming
    pub open_timeout_ms: u64,
    /// Longest silence tolerated between two chunks
    pub idle_timeout_ms: u64,
    /// Extra attempts after a timeout that produced no output
    pub timeout_retries: u32,
    pub max_concurrent_requests: usize,
    /// Transport-level retries performed by the HTTP middleware before streaming starts
    pub transport_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            temperature: 0.7,
            max_tokens: 4000,
            open_timeout_ms: 60_000,
            idle_timeout_ms: 30_000,
            timeout_retries: 1,
            max_concurrent_requests: 3,
            transport_retries: 0,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            api_key: env::var("LLM_API_KEY")
                .or_else(|_| env::var("DEEPSEEK_API_KEY"))
                .unwrap_or_default(),
            base_url: env::var("LLM_BASE_URL").unwrap_or(defaults.base_url),
            model: env::var("LLM_MODEL").unwrap_or(defaults.model),
            temperature: env::var("LLM_TEMPERATURE")
                .unwrap_or_else(|_| defaults.temperature.to_string())
                .parse::<f32>()
                .context("Failed to parse LLM_TEMPERATURE")?,
            max_tokens: env::var("LLM_MAX_TOKENS")
                .unwrap_or_else(|_| defaults.max_tokens.to_string())
                .parse::<u32>()
                .context("Failed to parse LLM_MAX_TOKENS")?,
            open_timeout_ms: parse_u64("LLM_OPEN_TIMEOUT_MS", defaults.open_timeout_ms)?,
            idle_timeout_ms: parse_u64("LLM_IDLE_TIMEOUT_MS", defaults.idle_timeout_ms)?,
            timeout_retries: parse_u64("LLM_TIMEOUT_RETRIES", defaults.timeout_retries as u64)?
                as u32,
            max_concurrent_requests: parse_usize(
                "LLM_MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
            transport_retries: parse_u64(
                "LLM_TRANSPORT_RETRIES",
                defaults.transport_retries as u64,
            )? as u32,
        })
    }
}

/// Aggregated provider configuration
#[derive(Debug, Clone, Default)]
pub struct ProviderEnvConfig {
    pub binance: BinanceConfig,
    pub llm: LlmConfig,
}

impl ProviderEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            binance: BinanceConfig::from_env().context("Failed to load Binance config")?,
            llm: LlmConfig::from_env().context("Failed to load LLM config")?,
        })
    }
}

pub(crate) fn parse_u64(key: &str, default: u64) -> Result<u64> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .context(format!("Failed to parse {}", key))
}

pub(crate) fn parse_usize(key: &str, default: usize) -> Result<usize> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<usize>()
        .context(format!("Failed to parse {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_config_defaults() {
        let config = BinanceConfig::default();
        assert!(config.base_url.contains("binance.com"));
        assert_eq!(config.max_concurrent_requests, 5);
    }

    #[test]
    fn test_llm_config_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.model, "deepseek-chat");
        assert_eq!(config.max_tokens, 4000);
        assert_eq!(config.timeout_retries, 1);
        assert!(config.api_key.is_empty());
    }
}
