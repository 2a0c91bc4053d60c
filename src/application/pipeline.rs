use crate::application::analysis::{ContextAggregator, IndicatorEngine};
use crate::application::cache::{CacheLookup, LookupSource, PredictionCache};
use crate::application::concurrency::{CancelGuard, CancelToken};
use crate::application::inference::{InferenceClient, InferenceEvent};
use crate::application::market_data::MarketDataSource;
use crate::application::streaming::{StreamBroadcaster, StreamEvent};
use crate::domain::analysis::prediction::{PredictionParams, PredictionResult};
use crate::domain::errors::{InferenceError, PredictionError};
use crate::domain::market::symbol::Symbol;
use crate::domain::ports::SnapshotRequest;
use crate::infrastructure::observability::Metrics;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum PredictionUpdate {
    /// Raw model output, in order
    Chunk(String),
    Result {
        result: Arc<PredictionResult>,
        source: LookupSource,
    },
    Error(PredictionError),
}

/// Updates of one `predict_once` call: chunks, then exactly one result or error.
///
/// Chunks are only produced for the caller that started the computation;
/// callers served from the cache or joining a running computation receive the
/// terminal item alone. Dropping the stream cancels the request.
pub struct PredictionStream {
    rx: mpsc::Receiver<PredictionUpdate>,
    _guard: CancelGuard,
}

impl Stream for PredictionStream {
    type Item = PredictionUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl PredictionStream {
    /// Skips chunks and returns the terminal item
    pub async fn collect_result(mut self) -> Result<CacheLookup, PredictionError> {
        while let Some(update) = self.next().await {
            match update {
                PredictionUpdate::Chunk(_) => continue,
                PredictionUpdate::Result { result, source } => {
                    return Ok(CacheLookup { result, source });
                }
                PredictionUpdate::Error(e) => return Err(e),
            }
        }
        Err(PredictionError::Internal {
            reason: "prediction ended without a result".to_string(),
        })
    }
}

/// The per-symbol compute path: fetch, indicators, context, inference, cache.
///
/// Stages run strictly in sequence for one symbol. Progress is published to
/// the broadcaster once per computation, not once per waiter.
pub struct PredictionPipeline {
    source: Arc<MarketDataSource>,
    engine: IndicatorEngine,
    aggregator: ContextAggregator,
    inference: InferenceClient,
    cache: PredictionCache,
    broadcaster: StreamBroadcaster,
    metrics: Option<Metrics>,
}

impl PredictionPipeline {
    pub fn new(
        source: Arc<MarketDataSource>,
        engine: IndicatorEngine,
        aggregator: ContextAggregator,
        inference: InferenceClient,
        cache: PredictionCache,
        broadcaster: StreamBroadcaster,
    ) -> Self {
        Self {
            source,
            engine,
            aggregator,
            inference,
            cache,
            broadcaster,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    pub fn broadcaster(&self) -> &StreamBroadcaster {
        &self.broadcaster
    }

    pub fn source(&self) -> &MarketDataSource {
        &self.source
    }

    /// Shared handle for services polling the same provider, such as the ticker feed
    pub fn source_handle(&self) -> Arc<MarketDataSource> {
        self.source.clone()
    }

    pub fn inference(&self) -> &InferenceClient {
        &self.inference
    }

    /// Streams one prediction for `symbol`
    pub fn predict_once(
        self: &Arc<Self>,
        symbol: Symbol,
        params: PredictionParams,
        cancel: &CancelToken,
    ) -> PredictionStream {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let token = cancel.child();
        let pipeline = self.clone();
        let task_token = token.clone();

        tokio::spawn(async move {
            let update = match pipeline
                .resolve_with(symbol, params, &task_token, Some(tx.clone()))
                .await
            {
                Ok(lookup) => PredictionUpdate::Result {
                    result: lookup.result,
                    source: lookup.source,
                },
                Err(e) => PredictionUpdate::Error(e),
            };
            let _ = tx.send(update).await;
        });

        PredictionStream {
            rx,
            _guard: token.drop_guard(),
        }
    }

    /// Cached result for `symbol`, computing it at most once across concurrent callers
    pub async fn resolve(
        self: &Arc<Self>,
        symbol: Symbol,
        params: PredictionParams,
        cancel: &CancelToken,
    ) -> Result<CacheLookup, PredictionError> {
        self.resolve_with(symbol, params, cancel, None).await
    }

    async fn resolve_with(
        self: &Arc<Self>,
        symbol: Symbol,
        params: PredictionParams,
        cancel: &CancelToken,
        chunks: Option<mpsc::Sender<PredictionUpdate>>,
    ) -> Result<CacheLookup, PredictionError> {
        let key = self.cache.key_for(&symbol, &params);
        let pipeline = self.clone();
        let compute_symbol = symbol.clone();

        let lookup = self
            .cache
            .get_or_compute(key, cancel, move |flight| async move {
                pipeline
                    .compute(compute_symbol, params, flight, chunks)
                    .await
            })
            .await?;

        if lookup.source == LookupSource::Hit {
            debug!("PredictionPipeline: {} served from cache", symbol);
            self.broadcaster.publish(StreamEvent::PredictionCompleted {
                symbol,
                cached: true,
                result: lookup.result.as_ref().clone(),
            });
        }
        Ok(lookup)
    }

    /// Full uncached computation, run once per cache flight
    async fn compute(
        &self,
        symbol: Symbol,
        params: PredictionParams,
        cancel: CancelToken,
        chunks: Option<mpsc::Sender<PredictionUpdate>>,
    ) -> Result<PredictionResult, PredictionError> {
        let started = Instant::now();
        self.broadcaster.publish(StreamEvent::PredictionStarted {
            symbol: symbol.clone(),
        });

        let outcome = self.run_stages(&symbol, &params, &cancel, chunks).await;

        let status = match &outcome {
            Ok(result) => {
                info!(
                    "PredictionPipeline: {} completed in {:?} ({:?})",
                    symbol,
                    started.elapsed(),
                    result.completeness
                );
                self.broadcaster.publish(StreamEvent::PredictionCompleted {
                    symbol: symbol.clone(),
                    cached: false,
                    result: result.clone(),
                });
                if result.is_partial() { "partial" } else { "ok" }
            }
            Err(e) if e.is_cancelled() => {
                debug!("PredictionPipeline: {} cancelled", symbol);
                "cancelled"
            }
            Err(e) => {
                warn!("PredictionPipeline: {} failed: {}", symbol, e);
                self.broadcaster.publish(StreamEvent::PredictionFailed {
                    symbol: symbol.clone(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
                e.kind()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_prediction(status, started.elapsed().as_secs_f64());
        }
        outcome
    }

    async fn run_stages(
        &self,
        symbol: &Symbol,
        params: &PredictionParams,
        cancel: &CancelToken,
        chunks: Option<mpsc::Sender<PredictionUpdate>>,
    ) -> Result<PredictionResult, PredictionError> {
        let request = SnapshotRequest {
            symbol: symbol.clone(),
            timeframes: params.timeframes().to_vec(),
            kline_limit: params.kline_limit,
            depth_limit: params.depth_limit,
        };
        let snapshot = self.source.fetch_with(&request, cancel).await?;

        let indicator_sets = self.engine.compute_all(&snapshot)?;
        let context =
            self.aggregator
                .build(symbol, params.timeframes(), vec![snapshot], indicator_sets)?;

        let mut stream = self.inference.infer(&context, params, cancel);
        while let Some(item) = stream.next().await {
            match item {
                Ok(InferenceEvent::Chunk(text)) => {
                    self.broadcaster.publish(StreamEvent::PredictionChunk {
                        symbol: symbol.clone(),
                        text: text.clone(),
                    });
                    if let Some(tx) = &chunks {
                        // the requesting caller may have left; other waiters still need the result
                        let _ = tx.send(PredictionUpdate::Chunk(text)).await;
                    }
                }
                Ok(InferenceEvent::Completed(result)) => return Ok(result),
                Err(InferenceError::Cancelled) => return Err(PredictionError::Cancelled),
                Err(e) => return Err(e.into()),
            }
        }
        Err(PredictionError::Internal {
            reason: "inference ended without a result".to_string(),
        })
    }
}
