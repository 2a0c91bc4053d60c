use crate::application::cache::{CacheLookup, LookupSource};
use crate::application::concurrency::CancelToken;
use crate::application::pipeline::PredictionPipeline;
use crate::application::streaming::{StreamBroadcaster, StreamEvent};
use crate::domain::analysis::prediction::{PredictionParams, PredictionResult};
use crate::domain::errors::PredictionError;
use crate::domain::market::symbol::Symbol;
use crate::infrastructure::observability::Metrics;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Resolves one symbol of a scan
#[async_trait]
pub trait SymbolResolver: Send + Sync {
    async fn resolve_symbol(
        self: Arc<Self>,
        symbol: Symbol,
        params: PredictionParams,
        cancel: CancelToken,
    ) -> Result<CacheLookup, PredictionError>;
}

#[async_trait]
impl SymbolResolver for PredictionPipeline {
    async fn resolve_symbol(
        self: Arc<Self>,
        symbol: Symbol,
        params: PredictionParams,
        cancel: CancelToken,
    ) -> Result<CacheLookup, PredictionError> {
        self.resolve(symbol, params, &cancel).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    /// Worker count
    pub concurrency: usize,
    /// Watchdog limit for one symbol
    pub symbol_timeout: Duration,
    /// Extra passes for a symbol whose model call timed out on every attempt
    pub timeout_retries: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            symbol_timeout: Duration::from_secs(120),
            timeout_retries: 1,
        }
    }
}

/// A batch of symbols analysed with shared parameters
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub id: Uuid,
    symbols: Vec<Symbol>,
    pub params: PredictionParams,
}

impl ScanJob {
    /// Duplicate symbols are dropped, first occurrence wins
    pub fn new(symbols: impl IntoIterator<Item = Symbol>, params: PredictionParams) -> Self {
        let mut seen = HashSet::new();
        let symbols = symbols
            .into_iter()
            .filter(|s| seen.insert(s.clone()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            symbols,
            params,
        }
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

#[derive(Debug, Clone)]
pub struct SymbolOutcome {
    pub symbol: Symbol,
    pub result: Result<Arc<PredictionResult>, PredictionError>,
    /// Where a successful result came from
    pub source: Option<LookupSource>,
    pub elapsed: Duration,
}

impl SymbolOutcome {
    pub fn status(&self) -> &'static str {
        match &self.result {
            Ok(r) if r.is_partial() => "partial",
            Ok(_) => "ok",
            Err(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cached: usize,
    pub partial: usize,
    pub elapsed_ms: u64,
}

/// One outcome per requested symbol, in request order
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub outcomes: Vec<SymbolOutcome>,
    pub summary: ScanSummary,
}

impl ScanReport {
    pub fn outcome(&self, symbol: &Symbol) -> Option<&SymbolOutcome> {
        self.outcomes.iter().find(|o| &o.symbol == symbol)
    }
}

/// Fans a [`ScanJob`] out over a bounded pool of workers.
///
/// Workers drain a shared queue. One symbol failing, timing out or panicking
/// never stops the others, and the report always holds exactly one outcome
/// per requested symbol.
pub struct ScanCoordinator {
    resolver: Arc<dyn SymbolResolver>,
    broadcaster: StreamBroadcaster,
    config: ScanConfig,
    metrics: Option<Metrics>,
}

impl ScanCoordinator {
    pub fn new(
        resolver: Arc<dyn SymbolResolver>,
        broadcaster: StreamBroadcaster,
        config: ScanConfig,
    ) -> Self {
        Self {
            resolver,
            broadcaster,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn scan(&self, job: ScanJob, cancel: &CancelToken) -> ScanReport {
        let started = Instant::now();
        let total = job.symbols.len();
        let workers = self.config.concurrency.max(1).min(total.max(1));
        info!(
            "ScanCoordinator: Scan {} started ({} symbols, {} workers)",
            job.id, total, workers
        );

        let queue: Arc<Mutex<VecDeque<(usize, Symbol)>>> =
            Arc::new(Mutex::new(job.symbols.iter().cloned().enumerate().collect()));
        let (tx, mut rx) = mpsc::channel::<(usize, SymbolOutcome)>(total.max(1));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                queue: queue.clone(),
                tx: tx.clone(),
                resolver: self.resolver.clone(),
                params: job.params.clone(),
                timeout: self.config.symbol_timeout,
                timeout_retries: self.config.timeout_retries,
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(tx);

        let mut outcomes: Vec<Option<SymbolOutcome>> = vec![None; total];
        let mut completed = 0;
        while let Some((index, outcome)) = rx.recv().await {
            completed += 1;
            self.on_outcome(job.id, completed, total, &outcome);
            outcomes[index] = Some(outcome);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("ScanCoordinator: Worker crashed during scan {}: {}", job.id, e);
            }
        }

        let outcomes: Vec<SymbolOutcome> = outcomes
            .into_iter()
            .zip(job.symbols.iter())
            .map(|(outcome, symbol)| {
                outcome.unwrap_or_else(|| SymbolOutcome {
                    symbol: symbol.clone(),
                    result: Err(PredictionError::Internal {
                        reason: "worker terminated before reporting".to_string(),
                    }),
                    source: None,
                    elapsed: Duration::ZERO,
                })
            })
            .collect();

        let summary = summarize(&outcomes, started.elapsed());
        info!(
            "ScanCoordinator: Scan {} finished: {}/{} ok ({} cached, {} partial) in {}ms",
            job.id,
            summary.succeeded,
            summary.total,
            summary.cached,
            summary.partial,
            summary.elapsed_ms
        );
        ScanReport {
            scan_id: job.id,
            outcomes,
            summary,
        }
    }

    fn on_outcome(&self, scan_id: Uuid, completed: usize, total: usize, outcome: &SymbolOutcome) {
        let status = outcome.status();
        if let Err(e) = &outcome.result {
            if !e.is_cancelled() {
                warn!("ScanCoordinator: {} failed: {}", outcome.symbol, e);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_scan_outcome(status);
        }
        self.broadcaster.publish(StreamEvent::ScanProgress {
            scan_id,
            completed,
            total,
            symbol: outcome.symbol.clone(),
            status: status.to_string(),
        });
    }
}

fn summarize(outcomes: &[SymbolOutcome], elapsed: Duration) -> ScanSummary {
    let mut summary = ScanSummary {
        total: outcomes.len(),
        elapsed_ms: elapsed.as_millis() as u64,
        ..ScanSummary::default()
    };
    for outcome in outcomes {
        match &outcome.result {
            Ok(result) => {
                summary.succeeded += 1;
                if result.is_partial() {
                    summary.partial += 1;
                }
                if outcome.source == Some(LookupSource::Hit) {
                    summary.cached += 1;
                }
            }
            Err(_) => summary.failed += 1,
        }
    }
    summary
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<(usize, Symbol)>>>,
    tx: mpsc::Sender<(usize, SymbolOutcome)>,
    resolver: Arc<dyn SymbolResolver>,
    params: PredictionParams,
    timeout: Duration,
    timeout_retries: u32,
    cancel: CancelToken,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Worker {
    fn next(&self) -> Option<(usize, Symbol)> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    async fn run(self) {
        while let Some((index, symbol)) = self.next() {
            let started = Instant::now();
            let (result, source) = if self.cancel.is_cancelled() {
                (Err(PredictionError::Cancelled), None)
            } else {
                match AssertUnwindSafe(self.resolve(&symbol)).catch_unwind().await {
                    Ok(resolved) => resolved,
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        error!("ScanCoordinator: {} panicked: {}", symbol, reason);
                        (
                            Err(PredictionError::Internal {
                                reason: format!("symbol task panicked: {}", reason),
                            }),
                            None,
                        )
                    }
                }
            };
            let outcome = SymbolOutcome {
                symbol,
                result,
                source,
                elapsed: started.elapsed(),
            };
            if self.tx.send((index, outcome)).await.is_err() {
                break;
            }
        }
        tracing::debug!("ScanCoordinator: Worker {} drained", self.id);
    }

    async fn resolve(
        &self,
        symbol: &Symbol,
    ) -> (Result<Arc<PredictionResult>, PredictionError>, Option<LookupSource>) {
        let symbol_cancel = self.cancel.child();
        let resolving = async {
            let mut retries_left = self.timeout_retries;
            loop {
                let outcome = self
                    .resolver
                    .clone()
                    .resolve_symbol(symbol.clone(), self.params.clone(), symbol_cancel.clone())
                    .await;
                match outcome {
                    Err(e) if e.is_inference_timeout() && retries_left > 0 => {
                        retries_left -= 1;
                        warn!(
                            "ScanCoordinator: {} got no model answer in time ({}), retrying",
                            symbol, e
                        );
                    }
                    other => return other,
                }
            }
        };

        match tokio::time::timeout(self.timeout, resolving).await {
            Ok(Ok(lookup)) => (Ok(lookup.result), Some(lookup.source)),
            Ok(Err(e)) if e.is_cancelled() => (Err(PredictionError::Cancelled), None),
            Ok(Err(e)) => (Err(e), None),
            Err(_elapsed) => {
                symbol_cancel.cancel();
                warn!(
                    "ScanCoordinator: {} exceeded {:?}, abandoning",
                    symbol, self.timeout
                );
                (
                    Err(PredictionError::Timeout {
                        symbol: symbol.to_string(),
                        duration_ms: self.timeout.as_millis() as u64,
                    }),
                    None,
                )
            }
        }
    }
}
