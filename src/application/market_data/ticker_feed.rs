use super::market_data_source::MarketDataSource;
use super::volatility_monitor::VolatilityMonitor;
use crate::application::concurrency::CancelToken;
use crate::application::streaming::{StreamBroadcaster, StreamEvent};
use crate::domain::market::snapshot::Ticker24h;
use crate::domain::market::symbol::Symbol;
use crate::infrastructure::observability::Metrics;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Polls 24h tickers for a watchlist, publishes them and raises volatility alerts
pub struct TickerFeed {
    source: Arc<MarketDataSource>,
    broadcaster: StreamBroadcaster,
    watchlist: Vec<Symbol>,
    interval: Duration,
    monitor: VolatilityMonitor,
    last_volume: HashMap<Symbol, f64>,
    metrics: Option<Metrics>,
}

impl TickerFeed {
    pub fn new(
        source: Arc<MarketDataSource>,
        broadcaster: StreamBroadcaster,
        watchlist: Vec<Symbol>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            broadcaster,
            watchlist,
            interval,
            monitor: VolatilityMonitor::default(),
            last_volume: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn spawn(self, cancel: CancelToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancelToken) {
        info!(
            "TickerFeed: Watching {} symbols every {:?}",
            self.watchlist.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while cancel.run_until_cancelled(ticker.tick()).await.is_some() {
            if self.broadcaster.subscriber_count() == 0 {
                continue;
            }
            match self.source.fetch_tickers(&self.watchlist, &cancel).await {
                Ok(tickers) => {
                    let now = chrono::Utc::now().timestamp_millis();
                    self.poll_once(tickers, now);
                }
                Err(e) if cancel.is_cancelled() => {
                    debug!("TickerFeed: Stopping during fetch: {}", e);
                    break;
                }
                Err(e) => warn!("TickerFeed: Ticker fetch failed: {}", e),
            }
        }
        info!("TickerFeed: Stopped");
    }

    /// Feeds one batch of tickers through the monitor and publishes the results.
    /// Returns the number of alerts raised.
    pub fn poll_once(&mut self, tickers: Vec<Ticker24h>, now_ms: i64) -> usize {
        let mut alerts = 0;
        for ticker in &tickers {
            let (Some(price), Some(volume)) = (ticker.last_price.to_f64(), ticker.volume.to_f64())
            else {
                continue;
            };
            // 24h volume is cumulative; the monitor wants per-tick volume
            let delta = self
                .last_volume
                .insert(ticker.symbol.clone(), volume)
                .map_or(0.0, |previous| (volume - previous).max(0.0));
            self.monitor.add_tick(&ticker.symbol, price, delta, now_ms);

            if let Some(alert) = self.monitor.check(&ticker.symbol) {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_market_alert(&format!("{:?}", alert.kind).to_lowercase());
                }
                self.broadcaster.publish(StreamEvent::MarketAlert(alert));
                alerts += 1;
            }
        }
        self.broadcaster.publish(StreamEvent::TickerUpdate { tickers });
        alerts
    }
}
