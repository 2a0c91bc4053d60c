//! Binance USDⓈ-M futures market data over REST
//!
//! - Klines per timeframe (`/fapi/v1/klines`)
//! - Order book depth (`/fapi/v1/depth`)
//! - 24h ticker statistics (`/fapi/v1/ticker/24hr`)

use crate::domain::errors::FetchError;
use crate::domain::market::snapshot::{Candle, MarketSnapshot, OrderBook, OrderBookLevel, Ticker24h};
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use crate::domain::ports::{MarketDataProvider, SnapshotRequest};
use crate::infrastructure::core::{
    CircuitBreaker, CircuitBreakerError, HttpClientFactory, build_url_with_query,
};
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROVIDER: &str = "binance";
const DEPTH_LIMITS: [usize; 7] = [5, 10, 20, 50, 100, 500, 1000];
const MAX_KLINES: usize = 1500;

/// Failure of one REST call. `fault` marks errors that say something about
/// the exchange's health and therefore count against the circuit breaker.
struct CallFailure {
    error: FetchError,
    fault: bool,
}

impl CallFailure {
    fn fault(error: FetchError) -> Self {
        Self { error, fault: true }
    }

    fn benign(error: FetchError) -> Self {
        Self {
            error,
            fault: false,
        }
    }
}

pub struct BinanceMarketDataService {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
    request_timeout: Duration,
    circuit_breaker: CircuitBreaker,
}

impl BinanceMarketDataService {
    pub fn builder() -> BinanceMarketDataServiceBuilder {
        BinanceMarketDataServiceBuilder::default()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        subject: &str,
    ) -> Result<T, FetchError> {
        let url = build_url_with_query(&format!("{}{}", self.base_url, path), params);

        self.circuit_breaker
            .call(self.request(&url, path, subject), |failure: &CallFailure| failure.fault)
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open { retry_in, .. } => {
                    warn!("BinanceMarketDataService: Circuit open, rejecting {}", path);
                    FetchError::DataUnavailable {
                        symbol: subject.to_string(),
                        reason: format!("binance circuit open, retry in {:?}", retry_in),
                    }
                }
                CircuitBreakerError::Inner(failure) => failure.error,
            })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        path: &str,
        subject: &str,
    ) -> Result<T, CallFailure> {
        let mut request = self.client.get(url);
        if !self.api_key.is_empty() {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_failure(e, subject))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(status_failure(status, retry_after, &body, subject));
        }

        response.json::<T>().await.map_err(|e| {
            CallFailure::benign(FetchError::DataUnavailable {
                symbol: subject.to_string(),
                reason: format!("unexpected response from {}: {}", path, e),
            })
        })
    }

    fn transport_failure(&self, e: reqwest_middleware::Error, subject: &str) -> CallFailure {
        let timed_out = match &e {
            reqwest_middleware::Error::Reqwest(inner) => inner.is_timeout(),
            reqwest_middleware::Error::Middleware(_) => false,
        };
        if timed_out {
            CallFailure::fault(FetchError::Timeout {
                duration_ms: self.request_timeout.as_millis() as u64,
            })
        } else {
            CallFailure::fault(FetchError::DataUnavailable {
                symbol: subject.to_string(),
                reason: format!("request failed: {}", e),
            })
        }
    }

    async fn fetch_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<(Timeframe, Vec<Candle>), FetchError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_json(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_exchange()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", limit.clamp(1, MAX_KLINES).to_string()),
                ],
                &symbol.to_string(),
            )
            .await?;

        let candles = parse_klines(&rows);
        debug!(
            "BinanceMarketDataService: Fetched {} {} bars for {}",
            candles.len(),
            timeframe,
            symbol
        );
        Ok((timeframe, candles))
    }

    async fn fetch_depth(&self, symbol: &Symbol, limit: usize) -> Result<OrderBook, FetchError> {
        let depth: DepthResponse = self
            .get_json(
                "/fapi/v1/depth",
                &[
                    ("symbol", symbol.to_exchange()),
                    ("limit", depth_limit(limit).to_string()),
                ],
                &symbol.to_string(),
            )
            .await?;
        Ok(depth.into_order_book(limit))
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker24h, FetchError> {
        let raw: TickerResponse = self
            .get_json(
                "/fapi/v1/ticker/24hr",
                &[("symbol", symbol.to_exchange())],
                &symbol.to_string(),
            )
            .await?;
        raw.into_ticker(symbol.clone())
            .ok_or_else(|| FetchError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: "malformed 24h ticker".to_string(),
            })
    }
}

#[derive(Default)]
pub struct BinanceMarketDataServiceBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    request_timeout: Option<Duration>,
}

impl BinanceMarketDataServiceBuilder {
    pub fn api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> BinanceMarketDataService {
        let request_timeout = self.request_timeout.unwrap_or(Duration::from_secs(10));
        let base_url = self
            .base_url
            .unwrap_or_else(|| "https://fapi.binance.com".to_string())
            .trim_end_matches('/')
            .to_string();

        BinanceMarketDataService {
            // retries happen one level up, where backoff honours Retry-After
            client: HttpClientFactory::create_client(request_timeout, 0),
            api_key: self.api_key.unwrap_or_default(),
            base_url,
            request_timeout,
            circuit_breaker: CircuitBreaker::new(
                "BinanceMarketData",
                5,
                2,
                Duration::from_secs(30),
            ),
        }
    }
}

#[async_trait]
impl MarketDataProvider for BinanceMarketDataService {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn fetch_snapshot(&self, request: &SnapshotRequest) -> Result<MarketSnapshot, FetchError> {
        let symbol = &request.symbol;
        let klines = try_join_all(
            request
                .timeframes
                .iter()
                .map(|tf| self.fetch_klines(symbol, *tf, request.kline_limit)),
        );
        let (klines, order_book, ticker) = tokio::try_join!(
            klines,
            self.fetch_depth(symbol, request.depth_limit),
            self.fetch_ticker(symbol)
        )?;

        let series: BTreeMap<Timeframe, Vec<Candle>> = klines.into_iter().collect();
        info!(
            "BinanceMarketDataService: Snapshot for {} ({} timeframes, {} bids, {} asks)",
            symbol,
            series.len(),
            order_book.bids.len(),
            order_book.asks.len()
        );
        Ok(MarketSnapshot::new(
            symbol.clone(),
            chrono::Utc::now().timestamp_millis(),
            series,
            order_book,
            Some(ticker),
        ))
    }

    async fn fetch_tickers(&self, symbols: &[Symbol]) -> Result<Vec<Ticker24h>, FetchError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        // one call returns every contract; cheaper than N single-symbol calls
        let raw: Vec<TickerResponse> = self
            .get_json("/fapi/v1/ticker/24hr", &[], "tickers")
            .await?;

        let wanted: HashSet<String> = symbols.iter().map(Symbol::to_exchange).collect();
        let mut by_exchange: BTreeMap<String, TickerResponse> = raw
            .into_iter()
            .filter(|t| wanted.contains(&t.symbol))
            .map(|t| (t.symbol.clone(), t))
            .collect();

        Ok(symbols
            .iter()
            .filter_map(|s| {
                by_exchange
                    .remove(&s.to_exchange())
                    .and_then(|t| t.into_ticker(s.clone()))
            })
            .collect())
    }
}

/// Maps a non-success HTTP status onto a fetch error
fn status_failure(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: &str,
    subject: &str,
) -> CallFailure {
    match status.as_u16() {
        // 418 is Binance's escalation after ignored 429s
        429 | 418 => CallFailure::fault(FetchError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after_ms: retry_after_secs.map(|s| s * 1000),
        }),
        408 | 504 => CallFailure::fault(FetchError::Timeout { duration_ms: 0 }),
        code if code >= 500 => CallFailure::fault(FetchError::DataUnavailable {
            symbol: subject.to_string(),
            reason: format!("HTTP {}: {}", code, truncate(body)),
        }),
        code => CallFailure::benign(FetchError::DataUnavailable {
            symbol: subject.to_string(),
            reason: format!("HTTP {}: {}", code, truncate(body)),
        }),
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Smallest depth Binance accepts that covers `requested`
fn depth_limit(requested: usize) -> usize {
    DEPTH_LIMITS
        .iter()
        .copied()
        .find(|l| *l >= requested)
        .unwrap_or(DEPTH_LIMITS[DEPTH_LIMITS.len() - 1])
}

fn decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str_exact(s).ok(),
        serde_json::Value::Number(n) => n.as_f64().and_then(Decimal::from_f64_retain),
        _ => None,
    }
}

/// Kline rows are `[openTime, open, high, low, close, volume, closeTime, ...]`.
/// Rows that don't parse are skipped.
fn parse_klines(rows: &[Vec<serde_json::Value>]) -> Vec<Candle> {
    rows.iter()
        .filter_map(|row| {
            if row.len() < 6 {
                return None;
            }
            Some(Candle {
                timestamp: row[0].as_i64()?,
                open: decimal(&row[1])?,
                high: decimal(&row[2])?,
                low: decimal(&row[3])?,
                close: decimal(&row[4])?,
                volume: decimal(&row[5])?,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

impl DepthResponse {
    fn into_order_book(self, limit: usize) -> OrderBook {
        let levels = |raw: Vec<(String, String)>| -> Vec<OrderBookLevel> {
            raw.into_iter()
                .filter_map(|(price, quantity)| {
                    Some(OrderBookLevel {
                        price: Decimal::from_str_exact(&price).ok()?,
                        quantity: Decimal::from_str_exact(&quantity).ok()?,
                    })
                })
                .take(limit)
                .collect()
        };
        OrderBook {
            bids: levels(self.bids),
            asks: levels(self.asks),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    symbol: String,
    last_price: String,
    price_change_percent: String,
    high_price: String,
    low_price: String,
    volume: String,
    quote_volume: String,
}

impl TickerResponse {
    fn into_ticker(self, symbol: Symbol) -> Option<Ticker24h> {
        Some(Ticker24h {
            symbol,
            last_price: Decimal::from_str_exact(&self.last_price).ok()?,
            price_change_percent: Decimal::from_str_exact(&self.price_change_percent).ok()?,
            high_price: Decimal::from_str_exact(&self.high_price).ok()?,
            low_price: Decimal::from_str_exact(&self.low_price).ok()?,
            volume: Decimal::from_str_exact(&self.volume).ok()?,
            quote_volume: Decimal::from_str_exact(&self.quote_volume).ok()?,
        })
    }
}
