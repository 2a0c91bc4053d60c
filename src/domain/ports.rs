use crate::domain::errors::{FetchError, InferenceError};
use crate::domain::market::snapshot::{MarketSnapshot, Ticker24h};
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// What a market-data provider is asked for in one snapshot fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub symbol: Symbol,
    pub timeframes: Vec<Timeframe>,
    pub kline_limit: usize,
    pub depth_limit: usize,
}

// Need async_trait for async functions in dyn-compatible traits
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Klines for every requested timeframe, order book and 24h stats, as one snapshot
    async fn fetch_snapshot(&self, request: &SnapshotRequest) -> Result<MarketSnapshot, FetchError>;

    async fn fetch_tickers(&self, symbols: &[Symbol]) -> Result<Vec<Ticker24h>, FetchError>;
}

/// Generation request sent to a language-model backend
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub symbol: Symbol,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Item of a provider token stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderChunk {
    Delta(String),
    /// Terminal marker. `reason` is the provider's finish reason when it sent one.
    Finished { reason: Option<String> },
}

pub type ProviderStream = BoxStream<'static, Result<ProviderChunk, InferenceError>>;

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    /// Opens one long-lived generation. Errors here happen before any output.
    async fn open_stream(&self, request: InferenceRequest) -> Result<ProviderStream, InferenceError>;
}
