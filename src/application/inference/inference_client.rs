use super::prompt::{SYSTEM_PROMPT, build_user_prompt};
use super::response_parser::parse_strategy;
use super::strategy_guard::StrategyGuard;
use crate::application::concurrency::{CancelGuard, CancelToken, ConcurrencyLimiter};
use crate::domain::analysis::context::AnalysisContext;
use crate::domain::analysis::indicators::IndicatorName;
use crate::domain::analysis::prediction::{
    Completeness, PredictionParams, PredictionResult, StrategyPlan,
};
use crate::domain::errors::InferenceError;
use crate::domain::ports::{InferenceProvider, InferenceRequest, ProviderChunk};
use crate::infrastructure::observability::Metrics;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Limit on opening the stream, up to the first byte of the response
    pub open_timeout: Duration,
    /// Longest allowed gap between two chunks
    pub idle_timeout: Duration,
    /// Extra attempts after a timeout or interruption with no output
    pub timeout_retries: u32,
    pub channel_capacity: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4000,
            open_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            timeout_retries: 1,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceEvent {
    Chunk(String),
    Completed(PredictionResult),
}

/// Finite stream of chunks ending in exactly one `Completed` or error.
///
/// Dropping the stream cancels the producer, which releases its limiter
/// permit and the provider connection.
pub struct InferenceStream {
    rx: mpsc::Receiver<Result<InferenceEvent, InferenceError>>,
    _guard: CancelGuard,
}

impl Stream for InferenceStream {
    type Item = Result<InferenceEvent, InferenceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl InferenceStream {
    /// Drains the stream and returns its terminal item, discarding chunks
    pub async fn collect_result(mut self) -> Result<PredictionResult, InferenceError> {
        while let Some(item) = self.next().await {
            match item? {
                InferenceEvent::Chunk(_) => continue,
                InferenceEvent::Completed(result) => return Ok(result),
            }
        }
        Err(InferenceError::StreamInterrupted {
            reason: "producer ended without a result".to_string(),
        })
    }
}

/// What one attempt produced
enum Attempt {
    Complete(String),
    Partial { text: String, reason: String },
}

struct Job {
    provider: Arc<dyn InferenceProvider>,
    limiter: ConcurrencyLimiter,
    config: InferenceConfig,
    metrics: Option<Metrics>,
    request: InferenceRequest,
    fingerprint: String,
    guard: StrategyGuard,
    tx: mpsc::Sender<Result<InferenceEvent, InferenceError>>,
    cancel: CancelToken,
}

/// Streams a model's analysis of an [`AnalysisContext`].
///
/// Generation runs in a spawned task that holds one permit of the provider's
/// limiter for its whole lifetime and forwards chunks through a bounded
/// channel. Structured parsing happens once, after the terminal marker.
#[derive(Clone)]
pub struct InferenceClient {
    provider: Arc<dyn InferenceProvider>,
    limiter: ConcurrencyLimiter,
    config: InferenceConfig,
    metrics: Option<Metrics>,
}

impl InferenceClient {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        limiter: ConcurrencyLimiter,
        config: InferenceConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn infer(
        &self,
        context: &AnalysisContext,
        params: &PredictionParams,
        cancel: &CancelToken,
    ) -> InferenceStream {
        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string());
        let request = InferenceRequest {
            symbol: context.symbol().clone(),
            model,
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: build_user_prompt(context, params),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let atr = context
            .frame(params.primary_timeframe)
            .or_else(|| context.frames().last())
            .and_then(|f| f.indicators.get(IndicatorName::Atr));
        let guard = StrategyGuard::new(context.market().last_price, atr);

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let token = cancel.child();
        let job = Job {
            provider: self.provider.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            request,
            fingerprint: context.fingerprint().to_string(),
            guard,
            tx,
            cancel: token.clone(),
        };
        tokio::spawn(job.run());

        InferenceStream {
            rx,
            _guard: token.drop_guard(),
        }
    }
}

impl Job {
    async fn run(self) {
        let started = Instant::now();
        let outcome = self.generate().await;

        if let Some(metrics) = &self.metrics {
            let status = match &outcome {
                Ok(r) if r.is_partial() => "partial",
                Ok(_) => "ok",
                Err(InferenceError::Cancelled) => "cancelled",
                Err(InferenceError::ProviderError { .. }) => "provider_error",
                Err(_) => "failed",
            };
            metrics.observe_inference(&self.request.model, status, started.elapsed().as_secs_f64());
        }

        match &outcome {
            Ok(result) => info!(
                "InferenceClient: {} finished ({:?}, {} chars) in {:?}",
                self.request.symbol,
                result.completeness,
                result.raw_text.len(),
                started.elapsed()
            ),
            Err(InferenceError::Cancelled) => {
                debug!("InferenceClient: {} cancelled", self.request.symbol)
            }
            Err(e) => warn!("InferenceClient: {} failed: {}", self.request.symbol, e),
        }

        // the consumer may be gone already
        let _ = self.tx.send(outcome.map(InferenceEvent::Completed)).await;
    }

    async fn generate(&self) -> Result<PredictionResult, InferenceError> {
        let Some(_permit) = self.limiter.acquire(&self.cancel).await else {
            return Err(InferenceError::Cancelled);
        };

        let max_attempts = self.config.timeout_retries + 1;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let error = match self.attempt().await {
                Ok(Attempt::Complete(text)) => return self.finish(text, attempts),
                Ok(Attempt::Partial { text, reason }) => {
                    warn!(
                        "InferenceClient: {} stream ended early ({}), returning partial output",
                        self.request.symbol, reason
                    );
                    return Ok(self.result(text, Completeness::Partial, None));
                }
                Err(e) => e,
            };

            match error {
                InferenceError::ProviderTimeout { .. } | InferenceError::StreamInterrupted { .. }
                    if attempts < max_attempts =>
                {
                    warn!(
                        "InferenceClient: {} attempt {}/{} produced nothing: {}",
                        self.request.symbol, attempts, max_attempts, error
                    );
                }
                InferenceError::ProviderTimeout { .. } | InferenceError::StreamInterrupted { .. } => {
                    return Err(InferenceError::InferenceFailed {
                        attempts,
                        reason: error.to_string(),
                        timed_out: true,
                    });
                }
                other => return Err(other),
            }
        }
    }

    async fn attempt(&self) -> Result<Attempt, InferenceError> {
        let open_ms = self.config.open_timeout.as_millis() as u64;
        let opened = self
            .cancel
            .run_until_cancelled(tokio::time::timeout(
                self.config.open_timeout,
                self.provider.open_stream(self.request.clone()),
            ))
            .await;
        let mut stream = match opened {
            None => return Err(InferenceError::Cancelled),
            Some(Err(_elapsed)) => {
                return Err(InferenceError::ProviderTimeout {
                    duration_ms: open_ms,
                });
            }
            Some(Ok(result)) => result?,
        };

        let mut text = String::new();
        let idle_ms = self.config.idle_timeout.as_millis() as u64;
        loop {
            let next = self
                .cancel
                .run_until_cancelled(tokio::time::timeout(self.config.idle_timeout, stream.next()))
                .await;

            let interruption = match next {
                None => return Err(InferenceError::Cancelled),
                Some(Err(_elapsed)) => InferenceError::ProviderTimeout {
                    duration_ms: idle_ms,
                },
                Some(Ok(Some(Ok(ProviderChunk::Delta(delta))))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    if self.tx.send(Ok(InferenceEvent::Chunk(delta))).await.is_err() {
                        return Err(InferenceError::Cancelled);
                    }
                    continue;
                }
                Some(Ok(Some(Ok(ProviderChunk::Finished { reason })))) => {
                    if reason.as_deref() != Some("length") {
                        return Ok(Attempt::Complete(text));
                    }
                    InferenceError::StreamInterrupted {
                        reason: "output truncated at token limit".to_string(),
                    }
                }
                Some(Ok(Some(Err(e)))) => e,
                Some(Ok(None)) => InferenceError::StreamInterrupted {
                    reason: "stream ended without terminal marker".to_string(),
                },
            };

            return match interruption {
                InferenceError::ProviderError { .. } | InferenceError::Cancelled => {
                    Err(interruption)
                }
                _ if text.is_empty() => Err(interruption),
                _ => Ok(Attempt::Partial {
                    text,
                    reason: interruption.to_string(),
                }),
            };
        }
    }

    fn finish(&self, text: String, attempts: u32) -> Result<PredictionResult, InferenceError> {
        match parse_strategy(&text) {
            Ok(plan) => {
                let plan = self.guard.apply(plan);
                Ok(self.result(text, Completeness::Full, Some(plan)))
            }
            Err(e) => Err(InferenceError::InferenceFailed {
                attempts,
                reason: e.to_string(),
                timed_out: false,
            }),
        }
    }

    fn result(
        &self,
        text: String,
        completeness: Completeness,
        strategy: Option<StrategyPlan>,
    ) -> PredictionResult {
        PredictionResult {
            symbol: self.request.symbol.clone(),
            context_fingerprint: self.fingerprint.clone(),
            model: self.request.model.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
            completeness,
            raw_text: text,
            strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::analysis::{ContextAggregator, IndicatorEngine};
    use crate::domain::analysis::prediction::TradeSignal;
    use crate::domain::market::symbol::Symbol;
    use crate::domain::market::timeframe::Timeframe;
    use crate::domain::ports::{MarketDataProvider, SnapshotRequest};
    use crate::infrastructure::mock::{MockInferenceProvider, MockMarketDataProvider, ResponseBehavior};

    async fn context() -> AnalysisContext {
        let symbol = Symbol::parse("BTCUSDT").unwrap();
        let snapshot = MockMarketDataProvider::new()
            .fetch_snapshot(&SnapshotRequest {
                symbol: symbol.clone(),
                timeframes: vec![Timeframe::OneHour, Timeframe::FourHour],
                kline_limit: 100,
                depth_limit: 20,
            })
            .await
            .unwrap();
        let sets = IndicatorEngine::new().unwrap().compute_all(&snapshot).unwrap();
        ContextAggregator::default()
            .build(
                &symbol,
                &[Timeframe::OneHour, Timeframe::FourHour],
                vec![snapshot],
                sets,
            )
            .unwrap()
    }

    fn config() -> InferenceConfig {
        InferenceConfig {
            open_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(100),
            ..InferenceConfig::default()
        }
    }

    fn client(provider: Arc<MockInferenceProvider>) -> InferenceClient {
        InferenceClient::new(provider, ConcurrencyLimiter::new("llm", 1), config())
    }

    fn params() -> PredictionParams {
        PredictionParams::default().with_timeframes([Timeframe::OneHour, Timeframe::FourHour])
    }

    #[tokio::test]
    async fn test_complete_stream_yields_chunks_then_result() {
        let provider = Arc::new(MockInferenceProvider::new());
        let client = client(provider.clone());
        let ctx = context().await;

        let mut stream = client.infer(&ctx, &params(), &CancelToken::new());
        let mut chunks = String::new();
        let mut result = None;
        while let Some(item) = stream.next().await {
            match item.unwrap() {
                InferenceEvent::Chunk(c) => {
                    assert!(result.is_none(), "no chunk after the terminal item");
                    chunks.push_str(&c);
                }
                InferenceEvent::Completed(r) => result = Some(r),
            }
        }

        let result = result.unwrap();
        assert_eq!(result.completeness, Completeness::Full);
        assert_eq!(result.raw_text, chunks);
        assert_eq!(result.context_fingerprint, ctx.fingerprint());
        let plan = result.strategy.unwrap();
        assert_ne!(plan.signal, TradeSignal::Wait);
        assert_eq!(provider.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_before_output_is_retried_once() {
        let provider = Arc::new(MockInferenceProvider::new());
        provider.push_behavior(ResponseBehavior::TimeoutOnOpen);
        let client = client(provider.clone());

        let result = client
            .infer(&context().await, &params(), &CancelToken::new())
            .collect_result()
            .await
            .unwrap();

        assert_eq!(result.completeness, Completeness::Full);
        assert_eq!(provider.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_fail() {
        let provider = Arc::new(MockInferenceProvider::new());
        provider.push_behavior(ResponseBehavior::TimeoutOnOpen);
        provider.push_behavior(ResponseBehavior::TimeoutOnOpen);
        let client = client(provider.clone());

        let err = client
            .infer(&context().await, &params(), &CancelToken::new())
            .collect_result()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InferenceError::InferenceFailed {
                attempts: 2,
                timed_out: true,
                ..
            }
        ));
        assert_eq!(client.limiter().available(), 1);
    }

    #[tokio::test]
    async fn test_interruption_after_output_is_partial() {
        let provider = Arc::new(MockInferenceProvider::new());
        provider.push_behavior(ResponseBehavior::InterruptAfter(3));
        let client = client(provider.clone());

        let result = client
            .infer(&context().await, &params(), &CancelToken::new())
            .collect_result()
            .await
            .unwrap();

        assert!(result.is_partial());
        assert!(result.strategy.is_none());
        assert!(!result.raw_text.is_empty());
        assert_eq!(provider.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_not_retried() {
        let provider = Arc::new(MockInferenceProvider::new());
        provider.push_behavior(ResponseBehavior::Reject("invalid api key".to_string()));
        let client = client(provider.clone());

        let err = client
            .infer(&context().await, &params(), &CancelToken::new())
            .collect_result()
            .await
            .unwrap_err();

        assert!(matches!(err, InferenceError::ProviderError { .. }));
        assert_eq!(provider.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_complete_output_fails() {
        let provider = Arc::new(MockInferenceProvider::new());
        provider.push_behavior(ResponseBehavior::Text("no structured answer today".to_string()));
        let client = client(provider.clone());

        let err = client
            .infer(&context().await, &params(), &CancelToken::new())
            .collect_result()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InferenceError::InferenceFailed {
                attempts: 1,
                timed_out: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_permit() {
        let provider =
            Arc::new(MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(20)));
        let client = client(provider.clone());

        let mut stream = client.infer(&context().await, &params(), &CancelToken::new());
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, InferenceEvent::Chunk(_)));
        assert_eq!(client.limiter().available(), 0);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.limiter().available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_with_cancelled() {
        let provider =
            Arc::new(MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(20)));
        let client = client(provider.clone());
        let cancel = CancelToken::new();

        let stream = client.infer(&context().await, &params(), &cancel);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let err = stream.collect_result().await.unwrap_err();
        assert_eq!(err, InferenceError::Cancelled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.limiter().available(), 1);
    }
}
