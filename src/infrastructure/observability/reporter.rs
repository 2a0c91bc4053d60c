//! Push-based metrics reporter for Chainsight
//!
//! Periodically outputs a snapshot of the pipeline as structured JSON to stdout.

use crate::application::cache::{CacheStats, PredictionCache};
use crate::application::concurrency::CancelToken;
use crate::application::streaming::StreamBroadcaster;
use crate::infrastructure::observability::metrics::Metrics;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Metrics snapshot for JSON output
#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub cache: CacheSnapshot,
    pub stream: StreamSnapshot,
}

#[derive(Serialize)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl From<CacheStats> for CacheSnapshot {
    fn from(stats: CacheStats) -> Self {
        Self {
            entries: stats.entries,
            in_flight: stats.in_flight,
            hits: stats.hits,
            misses: stats.misses,
            joins: stats.joins,
            evictions: stats.evictions,
            hit_rate: stats.hit_rate,
        }
    }
}

#[derive(Serialize)]
pub struct StreamSnapshot {
    pub subscribers: usize,
    pub dropped_subscribers: u64,
}

/// Push-based metrics reporter
///
/// Outputs metrics as structured JSON logs on a configurable interval.
/// No HTTP server, no incoming connections.
pub struct MetricsReporter {
    cache: PredictionCache,
    broadcaster: StreamBroadcaster,
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        cache: PredictionCache,
        broadcaster: StreamBroadcaster,
        metrics: Metrics,
        interval_seconds: u64,
    ) -> Self {
        Self {
            cache,
            broadcaster,
            metrics,
            start_time: Instant::now(),
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Outputs a snapshot every interval until `cancel` fires
    pub async fn run(self, cancel: CancelToken) {
        info!(
            "MetricsReporter: Starting push-based metrics (interval: {:?})",
            self.interval
        );

        while cancel
            .run_until_cancelled(tokio::time::sleep(self.interval))
            .await
            .is_some()
        {
            let snapshot = self.collect_snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    // prefixed so log shippers can filter it
                    println!("METRICS_JSON:{}", json);
                    info!(
                        "Cache: {} entries, {} in flight, hit rate {:.1}% | Subscribers: {} | Uptime: {}s",
                        snapshot.cache.entries,
                        snapshot.cache.in_flight,
                        snapshot.cache.hit_rate * 100.0,
                        snapshot.stream.subscribers,
                        snapshot.uptime_seconds
                    );
                }
                Err(e) => warn!("MetricsReporter: Failed to serialize metrics: {}", e),
            }
        }
        info!("MetricsReporter: Stopped");
    }

    fn collect_snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let stats = self.cache.stats();

        self.metrics.uptime_seconds.set(uptime as f64);
        self.metrics.set_cache_size(stats.entries, stats.in_flight);

        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: uptime,
            version: env!("CARGO_PKG_VERSION").to_string(),
            cache: stats.into(),
            stream: StreamSnapshot {
                subscribers: self.broadcaster.subscriber_count(),
                dropped_subscribers: self.broadcaster.dropped_count(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cache::CacheConfig;
    use crate::application::streaming::Topic;

    #[test]
    fn test_snapshot_collection() {
        let broadcaster = StreamBroadcaster::new(4);
        let _sub = broadcaster.subscribe(Topic::Global);
        let metrics = Metrics::new().expect("Failed to create metrics");
        let reporter = MetricsReporter::new(
            PredictionCache::new(CacheConfig::default()),
            broadcaster,
            metrics,
            60,
        );

        let snapshot = reporter.collect_snapshot();
        assert_eq!(snapshot.cache.entries, 0);
        assert_eq!(snapshot.stream.subscribers, 1);

        let json = serde_json::to_string(&snapshot).expect("Failed to serialize");
        assert!(json.contains("\"hit_rate\":0.0"));
        assert!(!snapshot.timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let reporter = MetricsReporter::new(
            PredictionCache::new(CacheConfig::default()),
            StreamBroadcaster::new(4),
            Metrics::new().expect("Failed to create metrics"),
            60,
        );
        let cancel = CancelToken::new();
        let handle = tokio::spawn(reporter.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter did not stop")
            .expect("reporter panicked");
    }
}
