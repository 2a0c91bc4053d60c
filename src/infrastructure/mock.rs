//! Deterministic in-process providers for `MODE=mock`, demos and tests.

use crate::domain::errors::{FetchError, InferenceError};
use crate::domain::market::snapshot::{
    Candle, MarketSnapshot, OrderBook, OrderBookLevel, Ticker24h,
};
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use crate::domain::ports::{
    InferenceProvider, InferenceRequest, MarketDataProvider, ProviderChunk, ProviderStream,
    SnapshotRequest,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(8)
}

/// Reference price per base asset; unknown assets get a stable made-up one
fn base_price(symbol: &Symbol) -> f64 {
    match symbol.base() {
        "BTC" => 65_000.0,
        "ETH" => 3_200.0,
        "SOL" => 150.0,
        "BNB" => 580.0,
        "XRP" => 0.6,
        other => {
            let seed: u32 = other.bytes().map(u32::from).sum();
            1.0 + (seed % 500) as f64
        }
    }
}

/// Close of bar `i`: a steady climb with a gentle wave on top
fn path_close(base: f64, i: usize) -> f64 {
    let i = i as f64;
    base * (1.0 + 0.0015 * i + 0.01 * (i / 5.0).sin())
}

/// Market data provider producing a synthetic but well-formed market.
///
/// Every timeframe carries the same price path, so all series end at the
/// same close and the ticker agrees with them.
pub struct MockMarketDataProvider {
    latency: Duration,
    snapshot_calls: Mutex<HashMap<Symbol, usize>>,
    scripted_failures: Mutex<HashMap<Symbol, VecDeque<FetchError>>>,
    unavailable: Mutex<HashSet<Symbol>>,
    ticker_polls: AtomicUsize,
}

impl Default for MockMarketDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMarketDataProvider {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            snapshot_calls: Mutex::new(HashMap::new()),
            scripted_failures: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
            ticker_polls: AtomicUsize::new(0),
        }
    }

    /// Delays every snapshot by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues `error` for the next snapshot of `symbol`
    pub fn fail_next(&self, symbol: &Symbol, error: FetchError) {
        lock(&self.scripted_failures)
            .entry(symbol.clone())
            .or_default()
            .push_back(error);
    }

    /// Every snapshot of `symbol` fails as unavailable from now on
    pub fn fail_always(&self, symbol: &Symbol) {
        lock(&self.unavailable).insert(symbol.clone());
    }

    /// Snapshot attempts made for `symbol`, failed ones included
    pub fn snapshot_calls(&self, symbol: &Symbol) -> usize {
        lock(&self.snapshot_calls).get(symbol).copied().unwrap_or(0)
    }

    fn candles(&self, symbol: &Symbol, timeframe: Timeframe, count: usize, now: i64) -> Vec<Candle> {
        let base = base_price(symbol);
        let step = timeframe.to_millis();
        let last_open = timeframe.period_start(now);

        (0..count)
            .map(|i| {
                let close = path_close(base, i);
                let open = if i == 0 { base } else { path_close(base, i - 1) };
                Candle {
                    timestamp: last_open - (count - 1 - i) as i64 * step,
                    open: to_decimal(open),
                    high: to_decimal(open.max(close) * 1.003),
                    low: to_decimal(open.min(close) * 0.997),
                    close: to_decimal(close),
                    volume: to_decimal(100.0 + (i % 7) as f64 * 10.0),
                }
            })
            .collect()
    }

    fn ticker(&self, symbol: &Symbol, last: f64) -> Ticker24h {
        let open = last / 1.02;
        Ticker24h {
            symbol: symbol.clone(),
            last_price: to_decimal(last),
            price_change_percent: to_decimal((last - open) / open * 100.0).round_dp(2),
            high_price: to_decimal(last * 1.01),
            low_price: to_decimal(open * 0.99),
            volume: to_decimal(10_000.0),
            quote_volume: to_decimal(10_000.0 * last),
        }
    }

    fn order_book(&self, price: f64, depth: usize) -> OrderBook {
        let level = |k: usize, sign: f64| OrderBookLevel {
            price: to_decimal(price * (1.0 + sign * 0.0005 * (k + 1) as f64)),
            quantity: to_decimal(1.0 + (k % 5) as f64 * 0.5),
        };
        OrderBook {
            bids: (0..depth).map(|k| level(k, -1.0)).collect(),
            asks: (0..depth).map(|k| level(k, 1.0)).collect(),
        }
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketDataProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_snapshot(&self, request: &SnapshotRequest) -> Result<MarketSnapshot, FetchError> {
        let symbol = &request.symbol;
        *lock(&self.snapshot_calls).entry(symbol.clone()).or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if lock(&self.unavailable).contains(symbol) {
            return Err(FetchError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: "symbol not listed".to_string(),
            });
        }
        let scripted = lock(&self.scripted_failures)
            .get_mut(symbol)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            debug!("MockMarketDataProvider: Scripted failure for {}: {}", symbol, error);
            return Err(error);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let count = request.kline_limit.max(1);
        let series: BTreeMap<Timeframe, Vec<Candle>> = request
            .timeframes
            .iter()
            .map(|tf| (*tf, self.candles(symbol, *tf, count, now)))
            .collect();
        let last = path_close(base_price(symbol), count - 1);

        Ok(MarketSnapshot::new(
            symbol.clone(),
            now,
            series,
            self.order_book(last, request.depth_limit),
            Some(self.ticker(symbol, last)),
        ))
    }

    async fn fetch_tickers(&self, symbols: &[Symbol]) -> Result<Vec<Ticker24h>, FetchError> {
        let poll = self.ticker_polls.fetch_add(1, Ordering::Relaxed) as f64;
        Ok(symbols
            .iter()
            .map(|s| {
                let price = path_close(base_price(s), 99) * (1.0 + 0.001 * (poll / 3.0).sin());
                self.ticker(s, price)
            })
            .collect())
    }
}

/// How the mock model answers one generation
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBehavior {
    /// A consistent bullish plan around the prompt's current price
    Complete,
    /// Open fails with a provider timeout
    TimeoutOnOpen,
    /// The complete answer breaks off after `n` chunks
    InterruptAfter(usize),
    /// Open is refused with this reason
    Reject(String),
    /// Streams the given text verbatim, then finishes normally
    Text(String),
}

const CHUNK_CHARS: usize = 48;

/// Inference provider replaying scripted behaviours, [`ResponseBehavior::Complete`] once the script runs out
pub struct MockInferenceProvider {
    chunk_delay: Duration,
    script: Mutex<VecDeque<ResponseBehavior>>,
    open_calls: AtomicUsize,
}

impl Default for MockInferenceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInferenceProvider {
    pub fn new() -> Self {
        Self {
            chunk_delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            open_calls: AtomicUsize::new(0),
        }
    }

    /// Pauses before each chunk
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn push_behavior(&self, behavior: ResponseBehavior) {
        lock(&self.script).push_back(behavior);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    fn stream(&self, items: Vec<Result<ProviderChunk, InferenceError>>) -> ProviderStream {
        let delay = self.chunk_delay;
        stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed()
    }
}

/// Price quoted in the prompt's "Current price:" line
fn prompt_price(prompt: &str) -> Option<f64> {
    prompt
        .lines()
        .find_map(|line| line.trim().strip_prefix("Current price:"))
        .and_then(|p| p.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p > 0.0)
}

fn bullish_answer(symbol: &Symbol, price: f64) -> String {
    let level = |factor: f64| format!("{:.6}", price * factor);
    format!(
        "{symbol} holds above its rising averages with momentum intact.\n\n```json\n{{\n  \
         \"prediction\": \"bullish\",\n  \
         \"confidence\": 68,\n  \
         \"reasoning\": [\"Fast average above slow average\", \"Higher lows on the primary timeframe\"],\n  \
         \"key_levels\": {{\"strong_resistance\": {r2}, \"weak_resistance\": {r1}, \"current_price\": {p}, \"weak_support\": {s1}, \"strong_support\": {s2}}},\n  \
         \"entry_zone\": {{\"low\": {e_low}, \"high\": {e_high}}},\n  \
         \"stop_loss\": {sl},\n  \
         \"take_profit\": [{tp1}, {tp2}, {tp3}],\n  \
         \"risk_level\": \"medium\",\n  \
         \"risk_warning\": [\"Synthetic market data\"],\n  \
         \"summary\": \"Buy pullbacks toward support while the trend holds\"\n}}\n```\n",
        symbol = symbol,
        p = level(1.0),
        r2 = level(1.10),
        r1 = level(1.05),
        s1 = level(0.98),
        s2 = level(0.95),
        e_low = level(0.995),
        e_high = level(1.0),
        sl = level(0.97),
        tp1 = level(1.04),
        tp2 = level(1.08),
        tp3 = level(1.12),
    )
}

fn chunked(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl InferenceProvider for MockInferenceProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn open_stream(&self, request: InferenceRequest) -> Result<ProviderStream, InferenceError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.script)
            .pop_front()
            .unwrap_or(ResponseBehavior::Complete);
        debug!(
            "MockInferenceProvider: {:?} for {}",
            behavior, request.symbol
        );

        let answer = || {
            let price = prompt_price(&request.user_prompt).unwrap_or(100.0);
            chunked(&bullish_answer(&request.symbol, price))
        };
        let finished = || {
            Ok(ProviderChunk::Finished {
                reason: Some("stop".to_string()),
            })
        };

        let items: Vec<Result<ProviderChunk, InferenceError>> = match behavior {
            ResponseBehavior::TimeoutOnOpen => {
                return Err(InferenceError::ProviderTimeout { duration_ms: 0 });
            }
            ResponseBehavior::Reject(reason) => {
                return Err(InferenceError::ProviderError { reason });
            }
            ResponseBehavior::Complete => answer()
                .into_iter()
                .map(|c| Ok(ProviderChunk::Delta(c)))
                .chain(std::iter::once(finished()))
                .collect(),
            ResponseBehavior::InterruptAfter(n) => answer()
                .into_iter()
                .take(n)
                .map(|c| Ok(ProviderChunk::Delta(c)))
                .chain(std::iter::once(Err(InferenceError::StreamInterrupted {
                    reason: "connection reset by peer".to_string(),
                })))
                .collect(),
            ResponseBehavior::Text(text) => chunked(&text)
                .into_iter()
                .map(|c| Ok(ProviderChunk::Delta(c)))
                .chain(std::iter::once(finished()))
                .collect(),
        };
        Ok(self.stream(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::inference::response_parser::parse_strategy;
    use crate::domain::analysis::prediction::Direction;

    fn request(symbol: &str) -> SnapshotRequest {
        SnapshotRequest {
            symbol: Symbol::parse(symbol).unwrap(),
            timeframes: vec![Timeframe::OneHour, Timeframe::FourHour],
            kline_limit: 60,
            depth_limit: 10,
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_well_formed() {
        let provider = MockMarketDataProvider::new();
        let snapshot = provider.fetch_snapshot(&request("ETH")).await.unwrap();

        let hourly = snapshot.series(Timeframe::OneHour).unwrap();
        assert_eq!(hourly.len(), 60);
        assert!(hourly.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(hourly.iter().all(|c| c.high >= c.low && c.low > Decimal::ZERO));
        assert_eq!(snapshot.order_book().bids.len(), 10);
        assert_eq!(
            snapshot.ticker().unwrap().last_price,
            hourly.last().unwrap().close
        );
    }

    #[tokio::test]
    async fn test_prices_are_deterministic() {
        let provider = MockMarketDataProvider::new();
        let a = provider.fetch_snapshot(&request("SOL")).await.unwrap();
        let b = provider.fetch_snapshot(&request("SOL")).await.unwrap();
        assert_eq!(
            a.series(Timeframe::FourHour).unwrap().last().unwrap().close,
            b.series(Timeframe::FourHour).unwrap().last().unwrap().close
        );
        assert_eq!(provider.snapshot_calls(&Symbol::parse("SOL").unwrap()), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_come_first() {
        let provider = MockMarketDataProvider::new();
        let eth = Symbol::parse("ETH").unwrap();
        provider.fail_next(&eth, FetchError::Timeout { duration_ms: 5 });

        assert!(provider.fetch_snapshot(&request("ETH")).await.is_err());
        assert!(provider.fetch_snapshot(&request("ETH")).await.is_ok());
    }

    #[test]
    fn test_bullish_answer_parses() {
        let text = bullish_answer(&Symbol::parse("BTC").unwrap(), 65_000.0);
        let plan = parse_strategy(&text).unwrap();
        assert_eq!(plan.direction, Direction::Bullish);
        assert_eq!(plan.take_profit.len(), 3);
        assert!(plan.stop_loss.unwrap() < 65_000.0);
    }

    #[test]
    fn test_prompt_price_extraction() {
        assert_eq!(prompt_price("x\nCurrent price: 123.5\ny"), Some(123.5));
        assert_eq!(prompt_price("no price here"), None);
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let provider = MockInferenceProvider::new();
        provider.push_behavior(ResponseBehavior::Reject("nope".to_string()));
        let req = InferenceRequest {
            symbol: Symbol::parse("BTC").unwrap(),
            model: "mock-model".to_string(),
            system_prompt: String::new(),
            user_prompt: "Current price: 100".to_string(),
            temperature: 0.7,
            max_tokens: 100,
        };

        assert!(provider.open_stream(req.clone()).await.is_err());
        let items: Vec<_> = provider.open_stream(req).await.unwrap().collect().await;
        assert!(matches!(
            items.last(),
            Some(Ok(ProviderChunk::Finished { .. }))
        ));
        assert_eq!(provider.open_calls(), 2);
    }
}
