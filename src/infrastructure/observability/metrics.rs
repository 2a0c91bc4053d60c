//! Prometheus metrics definitions for Chainsight
//!
//! All metrics use the `chainsight_` prefix and are read-only.

use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
    core::{AtomicF64, GenericGauge},
};
use std::sync::Arc;

const LATENCY_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Prometheus metrics for the prediction pipeline
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Market data provider calls by provider, operation and status
    pub provider_latency_seconds: HistogramVec,
    /// Fetch retries by provider
    pub fetch_retries_total: CounterVec,
    /// Inference requests by model and status
    pub inference_latency_seconds: HistogramVec,
    /// End-to-end prediction computations by status
    pub prediction_latency_seconds: HistogramVec,
    /// Cache events (hit, miss, join, eviction)
    pub cache_events_total: CounterVec,
    /// Ready entries held by the prediction cache
    pub cache_entries: IntGauge,
    /// Computations currently in flight
    pub cache_in_flight: IntGauge,
    /// Live stream subscribers
    pub stream_subscribers: IntGauge,
    /// Subscribers disconnected for overflowing their buffer
    pub stream_dropped_subscribers_total: IntCounter,
    /// Volatility alerts by kind
    pub market_alerts_total: CounterVec,
    /// Scan outcomes by status
    pub scan_outcomes_total: CounterVec,
    /// Uptime in seconds
    pub uptime_seconds: GenericGauge<AtomicF64>,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let provider_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chainsight_provider_latency_seconds",
                "Market data provider call latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["provider", "operation", "status"],
        )?;
        registry.register(Box::new(provider_latency_seconds.clone()))?;

        let fetch_retries_total = CounterVec::new(
            Opts::new(
                "chainsight_fetch_retries_total",
                "Market data fetch retries by provider",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(fetch_retries_total.clone()))?;

        let inference_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chainsight_inference_latency_seconds",
                "Inference request latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["model", "status"],
        )?;
        registry.register(Box::new(inference_latency_seconds.clone()))?;

        let prediction_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chainsight_prediction_latency_seconds",
                "End-to-end prediction latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["status"],
        )?;
        registry.register(Box::new(prediction_latency_seconds.clone()))?;

        let cache_events_total = CounterVec::new(
            Opts::new("chainsight_cache_events_total", "Prediction cache events"),
            &["event"],
        )?;
        registry.register(Box::new(cache_events_total.clone()))?;

        let cache_entries = IntGauge::with_opts(Opts::new(
            "chainsight_cache_entries",
            "Ready entries in the prediction cache",
        ))?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_in_flight = IntGauge::with_opts(Opts::new(
            "chainsight_cache_in_flight",
            "Prediction computations in flight",
        ))?;
        registry.register(Box::new(cache_in_flight.clone()))?;

        let stream_subscribers = IntGauge::with_opts(Opts::new(
            "chainsight_stream_subscribers",
            "Live stream subscribers",
        ))?;
        registry.register(Box::new(stream_subscribers.clone()))?;

        let stream_dropped_subscribers_total = IntCounter::with_opts(Opts::new(
            "chainsight_stream_dropped_subscribers_total",
            "Subscribers disconnected for falling behind",
        ))?;
        registry.register(Box::new(stream_dropped_subscribers_total.clone()))?;

        let market_alerts_total = CounterVec::new(
            Opts::new("chainsight_market_alerts_total", "Volatility alerts raised"),
            &["kind"],
        )?;
        registry.register(Box::new(market_alerts_total.clone()))?;

        let scan_outcomes_total = CounterVec::new(
            Opts::new("chainsight_scan_outcomes_total", "Scan outcomes by status"),
            &["status"],
        )?;
        registry.register(Box::new(scan_outcomes_total.clone()))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "chainsight_uptime_seconds",
            "Process uptime in seconds",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            provider_latency_seconds,
            fetch_retries_total,
            inference_latency_seconds,
            prediction_latency_seconds,
            cache_events_total,
            cache_entries,
            cache_in_flight,
            stream_subscribers,
            stream_dropped_subscribers_total,
            market_alerts_total,
            scan_outcomes_total,
            uptime_seconds,
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn observe_provider_call(&self, provider: &str, operation: &str, status: &str, secs: f64) {
        self.provider_latency_seconds
            .with_label_values(&[provider, operation, status])
            .observe(secs);
    }

    pub fn inc_fetch_retries(&self, provider: &str) {
        self.fetch_retries_total.with_label_values(&[provider]).inc();
    }

    pub fn observe_inference(&self, model: &str, status: &str, secs: f64) {
        self.inference_latency_seconds
            .with_label_values(&[model, status])
            .observe(secs);
    }

    pub fn observe_prediction(&self, status: &str, secs: f64) {
        self.prediction_latency_seconds
            .with_label_values(&[status])
            .observe(secs);
    }

    pub fn inc_cache(&self, event: &str) {
        self.cache_events_total.with_label_values(&[event]).inc();
    }

    pub fn set_cache_size(&self, entries: usize, in_flight: usize) {
        self.cache_entries.set(entries as i64);
        self.cache_in_flight.set(in_flight as i64);
    }

    pub fn set_subscribers(&self, count: usize) {
        self.stream_subscribers.set(count as i64);
    }

    pub fn inc_dropped_subscribers(&self, count: u64) {
        self.stream_dropped_subscribers_total.inc_by(count);
    }

    pub fn inc_market_alert(&self, kind: &str) {
        self.market_alerts_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_scan_outcome(&self, status: &str) {
        self.scan_outcomes_total.with_label_values(&[status]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.inc_cache("hit");
        assert!(metrics.render().contains("chainsight_"));
    }

    #[test]
    fn test_labelled_counters() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.inc_cache("hit");
        metrics.inc_cache("hit");
        metrics.inc_cache("miss");
        metrics.inc_scan_outcome("timeout");
        let output = metrics.render();
        assert!(output.contains("chainsight_cache_events_total{event=\"hit\"} 2"));
        assert!(output.contains("chainsight_cache_events_total{event=\"miss\"} 1"));
        assert!(output.contains("chainsight_scan_outcomes_total{status=\"timeout\"} 1"));
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.set_cache_size(7, 2);
        metrics.set_subscribers(3);
        metrics.inc_dropped_subscribers(4);
        let output = metrics.render();
        assert!(output.contains("chainsight_cache_entries 7"));
        assert!(output.contains("chainsight_cache_in_flight 2"));
        assert!(output.contains("chainsight_stream_subscribers 3"));
        assert!(output.contains("chainsight_stream_dropped_subscribers_total 4"));
    }

    #[test]
    fn test_latency_histograms() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.observe_provider_call("binance", "snapshot", "ok", 0.2);
        metrics.observe_inference("deepseek-chat", "ok", 12.0);
        let output = metrics.render();
        assert!(output.contains("chainsight_provider_latency_seconds_count{operation=\"snapshot\",provider=\"binance\",status=\"ok\"} 1"));
        assert!(output.contains("chainsight_inference_latency_seconds_count"));
    }
}
