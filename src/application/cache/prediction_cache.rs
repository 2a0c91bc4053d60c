use crate::application::concurrency::CancelToken;
use crate::domain::analysis::cache_key::CacheKey;
use crate::domain::analysis::prediction::{PredictionParams, PredictionResult};
use crate::domain::errors::PredictionError;
use crate::domain::market::symbol::Symbol;
use crate::infrastructure::observability::Metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Ready entries kept before the least recently used one is evicted
    pub max_entries: usize,
    /// Width of the freshness window folded into cache keys; zero disables it
    pub bucket_width: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 256,
            bucket_width: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    /// Served from a ready entry
    Hit,
    /// This caller started the computation
    Computed,
    /// Attached to a computation another caller started
    Joined,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub result: Arc<PredictionResult>,
    pub source: LookupSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationScope {
    Key(CacheKey),
    Symbol(Symbol),
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub evictions: u64,
    pub entries: usize,
    pub in_flight: usize,
    pub hit_rate: f64,
}

type Shared = Option<Result<Arc<PredictionResult>, PredictionError>>;

enum Slot {
    Ready {
        result: Arc<PredictionResult>,
        expires_at: Instant,
        last_touch: u64,
    },
    InFlight {
        id: u64,
        rx: watch::Receiver<Shared>,
        state: Arc<FlightState>,
    },
}

/// Held by the slot and by every waiter, so a flight detached by
/// invalidation still learns when its last waiter leaves
struct FlightState {
    waiters: AtomicUsize,
    cancel: CancelToken,
}

#[derive(Default)]
struct Table {
    slots: HashMap<CacheKey, Slot>,
    next_id: u64,
    tick: u64,
    hits: u64,
    misses: u64,
    joins: u64,
    evictions: u64,
}

impl Table {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }

    fn evict_lru(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0;
        while self.ready_count() > max_entries {
            let oldest = self
                .slots
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Ready { last_touch, .. } => Some((k.clone(), *last_touch)),
                    Slot::InFlight { .. } => None,
                })
                .min_by_key(|(_, touch)| *touch)
                .map(|(k, _)| k);
            let Some(key) = oldest else { break };
            self.slots.remove(&key);
            evicted += 1;
        }
        self.evictions += evicted as u64;
        evicted
    }

    fn in_flight_id(&self, key: &CacheKey) -> Option<u64> {
        match self.slots.get(key) {
            Some(Slot::InFlight { id, .. }) => Some(*id),
            _ => None,
        }
    }
}

struct Inner {
    config: CacheConfig,
    table: Mutex<Table>,
    metrics: Option<Metrics>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Table> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("PredictionCache: Lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn record(&self, event: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_cache(event);
        }
    }

    /// Writes the outcome of flight `id` back, unless the flight was detached
    fn settle(&self, key: &CacheKey, id: u64, outcome: &Result<Arc<PredictionResult>, PredictionError>) {
        let mut table = self.lock();
        if table.in_flight_id(key) != Some(id) {
            debug!("PredictionCache: Flight for {} was detached, not storing", key);
            return;
        }
        match outcome {
            Ok(result) if !result.is_partial() => {
                let last_touch = table.touch();
                table.slots.insert(
                    key.clone(),
                    Slot::Ready {
                        result: result.clone(),
                        expires_at: Instant::now() + self.config.ttl,
                        last_touch,
                    },
                );
                let evicted = table.evict_lru(self.config.max_entries);
                if evicted > 0 {
                    debug!("PredictionCache: Evicted {} entries", evicted);
                    for _ in 0..evicted {
                        self.record("eviction");
                    }
                }
            }
            _ => {
                table.slots.remove(key);
            }
        }
    }

    /// Called when a waiter stops waiting, for any reason
    fn leave(&self, key: &CacheKey, id: u64, state: &FlightState) {
        // joins increment under the same lock
        let mut table = self.lock();
        let previous = state.waiters.fetch_sub(1, Ordering::SeqCst);
        if previous > 1 {
            return;
        }
        state.cancel.cancel();
        if table.in_flight_id(key) == Some(id) {
            table.slots.remove(key);
        }
        debug!("PredictionCache: Last waiter left {}, flight cancelled", key);
    }
}

/// Resolves a flight exactly once, including when the compute task panics
struct Flight {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
    tx: Option<watch::Sender<Shared>>,
}

impl Flight {
    fn resolve(&mut self, outcome: Result<PredictionResult, PredictionError>) {
        let Some(tx) = self.tx.take() else { return };
        let outcome = outcome.map(Arc::new);
        self.inner.settle(&self.key, self.id, &outcome);
        tx.send_replace(Some(outcome));
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("PredictionCache: Computation for {} aborted", self.key);
            self.resolve(Err(PredictionError::Internal {
                reason: "computation aborted".to_string(),
            }));
        }
    }
}

struct Waiter {
    inner: Arc<Inner>,
    key: CacheKey,
    id: u64,
    state: Arc<FlightState>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.inner.leave(&self.key, self.id, &self.state);
    }
}

/// Memoizes completed predictions with single-flight coordination.
///
/// Concurrent callers for the same key share one computation through a
/// promise slot. The computation runs in its own task, so a waiter that gives
/// up does not abort it for the others; it is cancelled only when every waiter
/// has left. Failures and partial results are delivered but never stored.
#[derive(Clone)]
pub struct PredictionCache {
    inner: Arc<Inner>,
}

impl PredictionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(Table::default()),
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(config: CacheConfig, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(Table::default()),
                metrics: Some(metrics),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Key for `symbol` and `params` in the current freshness window
    pub fn key_for(&self, symbol: &Symbol, params: &PredictionParams) -> CacheKey {
        CacheKey::new(
            symbol,
            params,
            chrono::Utc::now().timestamp_millis(),
            self.inner.config.bucket_width.as_millis() as u64,
        )
    }

    /// Ready, unexpired result for `key`
    pub fn get(&self, key: &CacheKey) -> Option<Arc<PredictionResult>> {
        let mut table = self.inner.lock();
        let tick = table.touch();
        match table.slots.get_mut(key) {
            Some(Slot::Ready {
                result,
                expires_at,
                last_touch,
            }) if *expires_at > Instant::now() => {
                *last_touch = tick;
                Some(result.clone())
            }
            _ => None,
        }
    }

    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        cancel: &CancelToken,
        compute: F,
    ) -> Result<CacheLookup, PredictionError>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<PredictionResult, PredictionError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(PredictionError::Cancelled);
        }

        let (mut rx, id, state, source, start) = {
            let mut table = self.inner.lock();
            let tick = table.touch();
            let now = Instant::now();

            match table.slots.get_mut(&key) {
                Some(Slot::Ready {
                    result,
                    expires_at,
                    last_touch,
                }) if *expires_at > now => {
                    *last_touch = tick;
                    let result = result.clone();
                    table.hits += 1;
                    drop(table);
                    self.inner.record("hit");
                    debug!("PredictionCache: Hit {}", key);
                    return Ok(CacheLookup {
                        result,
                        source: LookupSource::Hit,
                    });
                }
                Some(Slot::InFlight { id, rx, state }) => {
                    state.waiters.fetch_add(1, Ordering::SeqCst);
                    let joined = (rx.clone(), *id, state.clone(), LookupSource::Joined, None);
                    table.joins += 1;
                    joined
                }
                _ => {
                    table.misses += 1;
                    table.next_id += 1;
                    let id = table.next_id;
                    let (tx, rx) = watch::channel(None);
                    let flight = CancelToken::new();
                    let state = Arc::new(FlightState {
                        waiters: AtomicUsize::new(1),
                        cancel: flight.clone(),
                    });
                    table.slots.insert(
                        key.clone(),
                        Slot::InFlight {
                            id,
                            rx: rx.clone(),
                            state: state.clone(),
                        },
                    );
                    (rx, id, state, LookupSource::Computed, Some((tx, flight)))
                }
            }
        };

        let waiter = Waiter {
            inner: self.inner.clone(),
            key: key.clone(),
            id,
            state,
        };

        match start {
            Some((tx, flight_cancel)) => {
                self.inner.record("miss");
                debug!("PredictionCache: Miss {}, computing", key);
                let fut = compute(flight_cancel.clone());
                let mut flight = Flight {
                    inner: self.inner.clone(),
                    key: key.clone(),
                    id,
                    tx: Some(tx),
                };
                tokio::spawn(async move {
                    let outcome = flight_cancel
                        .run_until_cancelled(fut)
                        .await
                        .unwrap_or(Err(PredictionError::Cancelled));
                    flight.resolve(outcome);
                });
            }
            None => {
                self.inner.record("join");
                debug!("PredictionCache: Joined in-flight computation for {}", key);
            }
        }

        let shared = cancel
            .run_until_cancelled(async {
                rx.wait_for(Option::is_some)
                    .await
                    .map(|value| value.clone())
            })
            .await;
        drop(waiter);

        match shared {
            None => Err(PredictionError::Cancelled),
            Some(Ok(Some(Ok(result)))) => Ok(CacheLookup { result, source }),
            Some(Ok(Some(Err(e)))) => Err(e),
            Some(Ok(None)) | Some(Err(_)) => Err(PredictionError::Internal {
                reason: "computation ended without a result".to_string(),
            }),
        }
    }

    /// Removes matching ready entries and detaches matching in-flight slots.
    /// Returns the number of slots removed.
    pub fn invalidate(&self, scope: &InvalidationScope) -> usize {
        let mut table = self.inner.lock();
        let before = table.slots.len();
        match scope {
            InvalidationScope::Key(key) => {
                table.slots.remove(key);
            }
            InvalidationScope::Symbol(symbol) => {
                table.slots.retain(|key, _| key.symbol() != symbol);
            }
            InvalidationScope::All => table.slots.clear(),
        }
        let removed = before - table.slots.len();
        if removed > 0 {
            info!("PredictionCache: Invalidated {} entries ({:?})", removed, scope);
        }
        removed
    }

    /// Drops expired ready entries and returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut table = self.inner.lock();
        let before = table.slots.len();
        table.slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight { .. } => true,
        });
        before - table.slots.len()
    }

    /// Periodically calls [`cleanup_expired`](Self::cleanup_expired) until `cancel` fires
    pub fn spawn_janitor(&self, interval: Duration, cancel: CancelToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            while cancel.run_until_cancelled(ticker.tick()).await.is_some() {
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    debug!("PredictionCache: Janitor removed {} expired entries", removed);
                }
                if let Some(metrics) = &cache.inner.metrics {
                    let stats = cache.stats();
                    metrics.set_cache_size(stats.entries, stats.in_flight);
                }
            }
            debug!("PredictionCache: Janitor stopped");
        })
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.inner.lock();
        let entries = table.ready_count();
        let lookups = table.hits + table.misses + table.joins;
        CacheStats {
            hits: table.hits,
            misses: table.misses,
            joins: table.joins,
            evictions: table.evictions,
            entries,
            in_flight: table.slots.len() - entries,
            hit_rate: if lookups > 0 {
                (table.hits + table.joins) as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}
