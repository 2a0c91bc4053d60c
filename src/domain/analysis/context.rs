use crate::domain::analysis::indicators::IndicatorSet;
use crate::domain::market::snapshot::{Candle, MarketSnapshot, OrderBookSummary, Ticker24h};
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Per-timeframe slice of an analysis context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFrame {
    pub timeframe: Timeframe,
    /// `fetched_at` of the snapshot this frame was taken from
    pub fetched_at: i64,
    pub recent_candles: Vec<Candle>,
    pub indicators: IndicatorSet,
}

/// Market-wide view taken from the freshest contributing snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketView {
    pub last_price: f64,
    pub order_book: OrderBookSummary,
    pub ticker: Option<Ticker24h>,
}

#[derive(Serialize)]
struct CanonicalContext<'a> {
    symbol: &'a Symbol,
    data_as_of: i64,
    market: &'a MarketView,
    frames: &'a [ContextFrame],
}

/// The exact, deterministic bundle handed to inference.
///
/// The canonical payload and its fingerprint are computed once at construction.
/// `generated_at` is not part of the payload: identical snapshots and indicator
/// sets always serialize to identical bytes.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    symbol: Symbol,
    snapshots: Vec<MarketSnapshot>,
    frames: Vec<ContextFrame>,
    market: MarketView,
    generated_at: i64,
    data_as_of: i64,
    payload: String,
    fingerprint: String,
}

impl AnalysisContext {
    /// `frames` must already be in canonical timeframe order.
    pub fn new(
        symbol: Symbol,
        snapshots: Vec<MarketSnapshot>,
        frames: Vec<ContextFrame>,
        market: MarketView,
        generated_at: i64,
    ) -> Self {
        let data_as_of = frames.iter().map(|f| f.fetched_at).min().unwrap_or(0);

        let payload = serde_json::to_string(&CanonicalContext {
            symbol: &symbol,
            data_as_of,
            market: &market,
            frames: &frames,
        })
        .unwrap_or_default();
        let fingerprint = hex::encode(Sha256::digest(payload.as_bytes()));

        Self {
            symbol,
            snapshots,
            frames,
            market,
            generated_at,
            data_as_of,
            payload,
            fingerprint,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn snapshots(&self) -> &[MarketSnapshot] {
        &self.snapshots
    }

    pub fn frames(&self) -> &[ContextFrame] {
        &self.frames
    }

    pub fn frame(&self, timeframe: Timeframe) -> Option<&ContextFrame> {
        self.frames.iter().find(|f| f.timeframe == timeframe)
    }

    pub fn indicator_sets(&self) -> impl Iterator<Item = &IndicatorSet> {
        self.frames.iter().map(|f| &f.indicators)
    }

    pub fn market(&self) -> &MarketView {
        &self.market
    }

    pub fn generated_at(&self) -> i64 {
        self.generated_at
    }

    /// Oldest `fetched_at` among the contributing snapshots
    pub fn data_as_of(&self) -> i64 {
        self.data_as_of
    }

    pub fn canonical_payload(&self) -> &str {
        &self.payload
    }

    /// Hex SHA-256 of the canonical payload
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
