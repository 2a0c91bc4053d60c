//! Market data acquisition with bounded retries and a shared concurrency cap.

use crate::application::concurrency::{CancelToken, ConcurrencyLimiter, RetryPolicy};
use crate::domain::errors::FetchError;
use crate::domain::market::snapshot::{MarketSnapshot, Ticker24h};
use crate::domain::market::symbol::Symbol;
use crate::domain::market::timeframe::Timeframe;
use crate::domain::ports::{MarketDataProvider, SnapshotRequest};
use crate::infrastructure::observability::Metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fetches immutable snapshots from a [`MarketDataProvider`].
///
/// Every provider call holds one permit of the shared [`ConcurrencyLimiter`]
/// for its duration only; the permit is given back before any backoff sleep.
/// Rate limits and timeouts are retried according to the [`RetryPolicy`];
/// every other failure surfaces immediately. Nothing is cached here.
pub struct MarketDataSource {
    provider: Arc<dyn MarketDataProvider>,
    limiter: ConcurrencyLimiter,
    retry: RetryPolicy,
    request_timeout: Duration,
    kline_limit: usize,
    depth_limit: usize,
    metrics: Option<Metrics>,
}

impl MarketDataSource {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        limiter: ConcurrencyLimiter,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limiter,
            retry,
            request_timeout,
            kline_limit: 100,
            depth_limit: 20,
            metrics: None,
        }
    }

    pub fn with_limits(mut self, kline_limit: usize, depth_limit: usize) -> Self {
        self.kline_limit = kline_limit;
        self.depth_limit = depth_limit;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Snapshot for `symbol` with the default kline and depth limits
    pub async fn fetch(
        &self,
        symbol: &Symbol,
        timeframes: &[Timeframe],
        cancel: &CancelToken,
    ) -> Result<MarketSnapshot, FetchError> {
        let request = SnapshotRequest {
            symbol: symbol.clone(),
            timeframes: timeframes.to_vec(),
            kline_limit: self.kline_limit,
            depth_limit: self.depth_limit,
        };
        self.fetch_with(&request, cancel).await
    }

    pub async fn fetch_with(
        &self,
        request: &SnapshotRequest,
        cancel: &CancelToken,
    ) -> Result<MarketSnapshot, FetchError> {
        if request.timeframes.is_empty() {
            return Err(FetchError::DataUnavailable {
                symbol: request.symbol.to_string(),
                reason: "no timeframes requested".to_string(),
            });
        }

        let label = request.symbol.to_string();
        let snapshot = self
            .with_retry("snapshot", &label, cancel, || {
                self.provider.fetch_snapshot(request)
            })
            .await?;

        debug!(
            "MarketDataSource: Snapshot for {} ({} timeframes) fetched at {}",
            snapshot.symbol(),
            request.timeframes.len(),
            snapshot.fetched_at()
        );
        Ok(snapshot)
    }

    pub async fn fetch_tickers(
        &self,
        symbols: &[Symbol],
        cancel: &CancelToken,
    ) -> Result<Vec<Ticker24h>, FetchError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let label = format!("{} symbols", symbols.len());
        self.with_retry("tickers", &label, cancel, || {
            self.provider.fetch_tickers(symbols)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        label: &str,
        cancel: &CancelToken,
        mut call: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let provider = self.provider.name().to_string();
        let timeout_ms = self.request_timeout.as_millis() as u64;
        let mut retry = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let outcome = {
                let Some(_permit) = self.limiter.acquire(cancel).await else {
                    return Err(FetchError::Cancelled);
                };

                let started = Instant::now();
                let outcome = match cancel
                    .run_until_cancelled(tokio::time::timeout(self.request_timeout, call()))
                    .await
                {
                    None => return Err(FetchError::Cancelled),
                    Some(Err(_elapsed)) => Err(FetchError::Timeout {
                        duration_ms: timeout_ms,
                    }),
                    Some(Ok(result)) => result,
                };
                self.record(&provider, operation, &outcome, started.elapsed());
                outcome
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry + 1 < self.retry.max_attempts => {
                    let delay = self
                        .retry
                        .delay_for(retry, e.retry_after_ms().map(Duration::from_millis));
                    warn!(
                        "MarketDataSource: {} {} failed ({}), retry {}/{} in {:?}",
                        operation,
                        label,
                        e,
                        retry + 1,
                        self.retry.max_attempts - 1,
                        delay
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_fetch_retries(&provider);
                    }
                    if cancel
                        .run_until_cancelled(tokio::time::sleep(delay))
                        .await
                        .is_none()
                    {
                        return Err(FetchError::Cancelled);
                    }
                    retry += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        info!(
                            "MarketDataSource: {} {} giving up after {} attempts: {}",
                            operation,
                            label,
                            retry + 1,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    fn record<T>(
        &self,
        provider: &str,
        operation: &str,
        outcome: &Result<T, FetchError>,
        elapsed: Duration,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let status = match outcome {
            Ok(_) => "ok",
            Err(FetchError::RateLimited { .. }) => "rate_limited",
            Err(FetchError::Timeout { .. }) => "timeout",
            Err(FetchError::Cancelled) => "cancelled",
            Err(FetchError::DataUnavailable { .. }) => "unavailable",
        };
        metrics.observe_provider_call(provider, operation, status, elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockMarketDataProvider;

    fn btc() -> Symbol {
        Symbol::parse("BTCUSDT").unwrap()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: false,
        }
    }

    fn source(provider: Arc<MockMarketDataProvider>, attempts: u32) -> MarketDataSource {
        MarketDataSource::new(
            provider,
            ConcurrencyLimiter::new("mock", 2),
            fast_retry(attempts),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_fetch_returns_requested_timeframes() {
        let provider = Arc::new(MockMarketDataProvider::new());
        let source = source(provider.clone(), 3);

        let snapshot = source
            .fetch(
                &btc(),
                &[Timeframe::OneHour, Timeframe::FourHour],
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(snapshot.symbol(), &btc());
        assert_eq!(snapshot.series(Timeframe::OneHour).unwrap().len(), 100);
        assert!(snapshot.series(Timeframe::OneDay).is_none());
        assert_eq!(provider.snapshot_calls(&btc()), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(MockMarketDataProvider::new());
        provider.fail_next(&btc(), FetchError::Timeout { duration_ms: 1 });
        provider.fail_next(
            &btc(),
            FetchError::RateLimited {
                provider: "mock".to_string(),
                retry_after_ms: Some(10),
            },
        );
        let source = source(provider.clone(), 3);

        let result = source
            .fetch(&btc(), &[Timeframe::OneHour], &CancelToken::new())
            .await;

        assert!(result.is_ok());
        assert_eq!(provider.snapshot_calls(&btc()), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let provider = Arc::new(MockMarketDataProvider::new());
        for _ in 0..5 {
            provider.fail_next(&btc(), FetchError::Timeout { duration_ms: 1 });
        }
        let source = source(provider.clone(), 3);

        let result = source
            .fetch(&btc(), &[Timeframe::OneHour], &CancelToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::Timeout { .. })));
        assert_eq!(provider.snapshot_calls(&btc()), 3);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let provider = Arc::new(MockMarketDataProvider::new());
        provider.fail_always(&btc());
        let source = source(provider.clone(), 3);

        let result = source
            .fetch(&btc(), &[Timeframe::OneHour], &CancelToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::DataUnavailable { .. })));
        assert_eq!(provider.snapshot_calls(&btc()), 1);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(MockMarketDataProvider::new().with_latency(Duration::from_secs(5)));
        let source = source(provider.clone(), 2);

        let result = source
            .fetch(&btc(), &[Timeframe::OneHour], &CancelToken::new())
            .await;

        assert!(matches!(result, Err(FetchError::Timeout { duration_ms: 200 })));
        assert_eq!(provider.snapshot_calls(&btc()), 2);
        assert_eq!(source.limiter().available(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_releases_permit() {
        let provider = Arc::new(MockMarketDataProvider::new());
        provider.fail_next(
            &btc(),
            FetchError::RateLimited {
                provider: "mock".to_string(),
                retry_after_ms: Some(10_000),
            },
        );
        let source = Arc::new(source(provider.clone(), 3));
        let cancel = CancelToken::new();

        let task = {
            let source = source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                source
                    .fetch(&btc(), &[Timeframe::OneHour], &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.limiter().available(), 2, "no permit held while sleeping");
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancel should be prompt")
            .unwrap();
        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(provider.snapshot_calls(&btc()), 1);
    }
}
