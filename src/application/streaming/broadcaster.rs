use crate::application::market_data::volatility_monitor::MarketAlert;
use crate::domain::analysis::prediction::PredictionResult;
use crate::domain::market::snapshot::Ticker24h;
use crate::domain::market::symbol::Symbol;
use crate::infrastructure::observability::Metrics;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Live update relayed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    PredictionStarted {
        symbol: Symbol,
    },
    PredictionChunk {
        symbol: Symbol,
        text: String,
    },
    PredictionCompleted {
        symbol: Symbol,
        cached: bool,
        result: PredictionResult,
    },
    PredictionFailed {
        symbol: Symbol,
        kind: String,
        message: String,
    },
    TickerUpdate {
        tickers: Vec<Ticker24h>,
    },
    MarketAlert(MarketAlert),
    ScanProgress {
        scan_id: Uuid,
        completed: usize,
        total: usize,
        symbol: Symbol,
        status: String,
    },
}

impl StreamEvent {
    /// Symbol whose subscribers receive the event; `None` for global-only events
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            StreamEvent::PredictionStarted { symbol }
            | StreamEvent::PredictionChunk { symbol, .. }
            | StreamEvent::PredictionCompleted { symbol, .. }
            | StreamEvent::PredictionFailed { symbol, .. } => Some(symbol),
            StreamEvent::MarketAlert(alert) => Some(&alert.symbol),
            StreamEvent::TickerUpdate { .. } | StreamEvent::ScanProgress { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::PredictionStarted { .. } => "prediction_started",
            StreamEvent::PredictionChunk { .. } => "prediction_chunk",
            StreamEvent::PredictionCompleted { .. } => "prediction_completed",
            StreamEvent::PredictionFailed { .. } => "prediction_failed",
            StreamEvent::TickerUpdate { .. } => "ticker_update",
            StreamEvent::MarketAlert(_) => "market_alert",
            StreamEvent::ScanProgress { .. } => "scan_progress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Every event
    Global,
    /// Events about one symbol
    Symbol(Symbol),
}

impl Topic {
    fn accepts(&self, event: &StreamEvent) -> bool {
        match self {
            Topic::Global => true,
            Topic::Symbol(symbol) => event.symbol() == Some(symbol),
        }
    }
}

struct Subscriber {
    id: Uuid,
    topic: Topic,
    tx: mpsc::Sender<StreamEvent>,
    overflowed: Arc<AtomicBool>,
}

/// Receiving end of one subscription.
///
/// Ends when the broadcaster drops the subscriber, either on unsubscribe or
/// because its buffer overflowed. An overflowed subscription ends at once;
/// whatever it still had buffered is discarded.
pub struct Subscription {
    id: Uuid,
    topic: Topic,
    rx: mpsc::Receiver<StreamEvent>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// True once the broadcaster disconnected this subscription for being too slow
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn discard_if_overflowed(&mut self) -> bool {
        if !self.is_overflowed() {
            return false;
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        true
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.discard_if_overflowed() {
            return None;
        }
        let event = self.rx.recv().await;
        if self.discard_if_overflowed() {
            return None;
        }
        event
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        if self.discard_if_overflowed() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.discard_if_overflowed() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if self.discard_if_overflowed() => Poll::Ready(None),
            other => other,
        }
    }
}

/// Fan-out of [`StreamEvent`]s to client sessions.
///
/// Each subscriber owns a bounded buffer. Publishing never waits: a
/// subscriber whose buffer is full is disconnected on the spot. Closed
/// subscribers are pruned on the next publish.
#[derive(Clone)]
pub struct StreamBroadcaster {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    buffer: usize,
    dropped: Arc<AtomicU64>,
    metrics: Option<Metrics>,
}

impl StreamBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            buffer: buffer.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("StreamBroadcaster: Lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let overflowed = Arc::new(AtomicBool::new(false));
        let count = {
            let mut registry = self.registry();
            registry.push(Subscriber {
                id,
                topic: topic.clone(),
                tx,
                overflowed: overflowed.clone(),
            });
            registry.len()
        };
        debug!("StreamBroadcaster: Subscriber {} joined {:?}", id, topic);
        self.report_count(count);
        Subscription {
            id,
            topic,
            rx,
            overflowed,
        }
    }

    /// Returns false when `id` was not subscribed
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let (removed, count) = {
            let mut registry = self.registry();
            let before = registry.len();
            registry.retain(|s| s.id != id);
            (registry.len() < before, registry.len())
        };
        if removed {
            debug!("StreamBroadcaster: Subscriber {} left", id);
            self.report_count(count);
        }
        removed
    }

    /// Delivers `event` to every matching subscriber and returns how many received it
    pub fn publish(&self, event: StreamEvent) -> usize {
        let mut delivered = 0;
        let mut overflowed = 0u64;
        let count = {
            let mut registry = self.registry();
            registry.retain(|sub| {
                if !sub.topic.accepts(&event) {
                    return !sub.tx.is_closed();
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "StreamBroadcaster: Subscriber {} is too slow, disconnecting",
                            sub.id
                        );
                        sub.overflowed.store(true, Ordering::Release);
                        overflowed += 1;
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
            registry.len()
        };

        if overflowed > 0 {
            self.dropped.fetch_add(overflowed, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.inc_dropped_subscribers(overflowed);
            }
        }
        self.report_count(count);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Subscribers disconnected for overflowing their buffer
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn report_count(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn started(s: &str) -> StreamEvent {
        StreamEvent::PredictionStarted { symbol: sym(s) }
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let broadcaster = StreamBroadcaster::new(8);
        let mut global = broadcaster.subscribe(Topic::Global);
        let mut btc = broadcaster.subscribe(Topic::Symbol(sym("BTC")));

        assert_eq!(broadcaster.publish(started("BTC")), 2);
        assert_eq!(broadcaster.publish(started("ETH")), 1);
        assert_eq!(
            broadcaster.publish(StreamEvent::TickerUpdate {
                tickers: Vec::new()
            }),
            1
        );

        assert_eq!(btc.recv().await, Some(started("BTC")));
        assert!(btc.try_recv().is_none());
        assert_eq!(global.recv().await, Some(started("BTC")));
        assert_eq!(global.recv().await, Some(started("ETH")));
        assert_eq!(global.recv().await.map(|e| e.kind()), Some("ticker_update"));
    }

    #[tokio::test]
    async fn test_overflowing_subscriber_is_dropped() {
        let broadcaster = StreamBroadcaster::new(2);
        let mut slow = broadcaster.subscribe(Topic::Global);
        let mut fast = broadcaster.subscribe(Topic::Global);

        for _ in 0..2 {
            broadcaster.publish(started("BTC"));
            assert!(fast.recv().await.is_some());
        }
        // slow's buffer is full now
        assert_eq!(broadcaster.publish(started("BTC")), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.dropped_count(), 1);
        assert!(fast.recv().await.is_some());

        // the dropped stream loses its backlog and ends immediately
        assert!(slow.is_overflowed());
        assert!(slow.recv().await.is_none());
        assert!(slow.try_recv().is_none());
        assert!(!fast.is_overflowed());
    }

    #[tokio::test]
    async fn test_overflowed_stream_yields_nothing() {
        use futures::StreamExt;

        let broadcaster = StreamBroadcaster::new(1);
        let mut slow = broadcaster.subscribe(Topic::Symbol(sym("BTC")));
        broadcaster.publish(started("BTC"));
        assert_eq!(broadcaster.publish(started("BTC")), 0);

        assert!(slow.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let broadcaster = StreamBroadcaster::new(4);
        let sub = broadcaster.subscribe(Topic::Symbol(sym("ETH")));
        let _other = broadcaster.subscribe(Topic::Global);
        drop(sub);

        broadcaster.publish(started("BTC"));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let broadcaster = StreamBroadcaster::new(4);
        let mut sub = broadcaster.subscribe(Topic::Global);
        assert!(broadcaster.unsubscribe(sub.id()));
        assert!(!broadcaster.unsubscribe(sub.id()));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(StreamEvent::PredictionChunk {
            symbol: sym("BTC"),
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "prediction_chunk");
        assert_eq!(json["symbol"], "BTC/USDT");
        assert_eq!(json["text"], "hi");
    }
}
