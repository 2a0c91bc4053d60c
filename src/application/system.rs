use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::analysis::{ContextAggregator, IndicatorEngine};
use crate::application::cache::{CacheStats, InvalidationScope, PredictionCache};
use crate::application::concurrency::{CancelToken, ConcurrencyLimiter};
use crate::application::inference::InferenceClient;
use crate::application::market_data::{MarketDataSource, TickerFeed};
use crate::application::pipeline::{PredictionPipeline, PredictionStream};
use crate::application::scan::{ScanCoordinator, ScanJob, ScanReport};
use crate::application::streaming::{StreamBroadcaster, Subscription, Topic};
use crate::config::{Config, Mode};
use crate::domain::analysis::prediction::PredictionParams;
use crate::domain::market::symbol::Symbol;
use crate::domain::ports::{InferenceProvider, MarketDataProvider};
use crate::infrastructure::binance::BinanceMarketDataService;
use crate::infrastructure::llm::OpenAiCompatibleProvider;
use crate::infrastructure::mock::{MockInferenceProvider, MockMarketDataProvider};
use crate::infrastructure::observability::{Metrics, MetricsReporter};

/// Wired but not yet running system
pub struct Application {
    pub config: Config,
    pub pipeline: Arc<PredictionPipeline>,
    pub scanner: Arc<ScanCoordinator>,
    pub metrics: Metrics,
}

impl Application {
    /// Builds the providers selected by `config.mode` and wires the pipeline around them
    pub async fn build(config: Config) -> Result<Self> {
        info!("Building Chainsight Application (Mode: {:?})...", config.mode);

        let (market, llm): (Arc<dyn MarketDataProvider>, Arc<dyn InferenceProvider>) =
            match config.mode {
                Mode::Mock => {
                    info!("Using Mock providers (deterministic market, canned model output)");
                    (
                        Arc::new(MockMarketDataProvider::new()),
                        Arc::new(MockInferenceProvider::new()),
                    )
                }
                Mode::Live => {
                    let binance = &config.providers.binance;
                    let llm = &config.providers.llm;
                    info!(
                        "Using Binance market data ({}) and model {} at {}",
                        binance.base_url, llm.model, llm.base_url
                    );
                    let market = BinanceMarketDataService::builder()
                        .api_key(binance.api_key.clone())
                        .base_url(binance.base_url.clone())
                        .request_timeout(Duration::from_millis(binance.request_timeout_ms))
                        .build();
                    let inference = OpenAiCompatibleProvider::new(
                        &llm.base_url,
                        llm.api_key.clone(),
                        llm.model.clone(),
                        llm.transport_retries,
                    );
                    (Arc::new(market), Arc::new(inference))
                }
            };

        Self::with_providers(config, market, llm)
    }

    /// Wires the pipeline around caller-supplied providers
    pub fn with_providers(
        config: Config,
        market: Arc<dyn MarketDataProvider>,
        llm: Arc<dyn InferenceProvider>,
    ) -> Result<Self> {
        let metrics = Metrics::new()?;
        let providers = &config.providers;
        let pipeline_env = &config.pipeline;

        let source = MarketDataSource::new(
            market,
            ConcurrencyLimiter::new("market_data", providers.binance.max_concurrent_requests),
            config.retry_policy(),
            Duration::from_millis(providers.binance.request_timeout_ms),
        )
        .with_limits(pipeline_env.kline_limit, pipeline_env.depth_limit)
        .with_metrics(metrics.clone());

        let inference = InferenceClient::new(
            llm,
            ConcurrencyLimiter::new("inference", providers.llm.max_concurrent_requests),
            config.inference_config(),
        )
        .with_metrics(metrics.clone());

        let cache = PredictionCache::with_metrics(config.cache_config(), metrics.clone());
        let broadcaster =
            StreamBroadcaster::new(pipeline_env.subscriber_buffer).with_metrics(metrics.clone());

        let pipeline = Arc::new(
            PredictionPipeline::new(
                Arc::new(source),
                IndicatorEngine::new()?,
                ContextAggregator::new(config.aggregator_config()),
                inference,
                cache,
                broadcaster.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        let scanner = Arc::new(
            ScanCoordinator::new(pipeline.clone(), broadcaster, config.scan_config())
                .with_metrics(metrics.clone()),
        );

        Ok(Self {
            config,
            pipeline,
            scanner,
            metrics,
        })
    }

    /// Spawns the background services and hands back the running system
    pub fn start(self) -> SystemHandle {
        info!("Starting background services...");
        let root = CancelToken::new();
        let mut tasks = Vec::new();

        let janitor_every = Duration::from_secs(self.config.pipeline.cache_janitor_interval_secs);
        tasks.push(
            self.pipeline
                .cache()
                .spawn_janitor(janitor_every, root.child()),
        );

        let watchlist = self.config.pipeline.watchlist.clone();
        if watchlist.is_empty() {
            info!("Ticker feed disabled (empty watchlist)");
        } else {
            let feed = TickerFeed::new(
                self.pipeline.source_handle(),
                self.pipeline.broadcaster().clone(),
                watchlist,
                Duration::from_secs(self.config.pipeline.ticker_interval_secs),
            )
            .with_metrics(self.metrics.clone());
            tasks.push(feed.spawn(root.child()));
        }

        if self.config.observability.enabled {
            let reporter = MetricsReporter::new(
                self.pipeline.cache().clone(),
                self.pipeline.broadcaster().clone(),
                self.metrics.clone(),
                self.config.observability.interval_secs,
            );
            let token = root.child();
            tasks.push(tokio::spawn(reporter.run(token)));
            info!(
                "Metrics reporter started (interval: {}s)",
                self.config.observability.interval_secs
            );
        } else {
            info!("Metrics reporting disabled.");
        }

        SystemHandle {
            default_params: self.config.default_params(),
            pipeline: self.pipeline,
            scanner: self.scanner,
            metrics: self.metrics,
            root,
            tasks,
        }
    }
}

/// Running system. Every request is scoped under one root token that
/// [`shutdown`](Self::shutdown) cancels.
pub struct SystemHandle {
    pipeline: Arc<PredictionPipeline>,
    scanner: Arc<ScanCoordinator>,
    default_params: PredictionParams,
    pub metrics: Metrics,
    root: CancelToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SystemHandle {
    pub fn default_params(&self) -> PredictionParams {
        self.default_params.clone()
    }

    /// Token that request scopes should derive from
    pub fn root_token(&self) -> &CancelToken {
        &self.root
    }

    /// Streams one prediction. Dropping the stream abandons the request.
    pub fn predict_once(&self, symbol: Symbol, params: PredictionParams) -> PredictionStream {
        self.pipeline.predict_once(symbol, params, &self.root)
    }

    /// Like [`predict_once`](Self::predict_once), scoped under `cancel`.
    /// Derive `cancel` from [`root_token`](Self::root_token) so shutdown reaches it.
    pub fn predict_once_with(
        &self,
        symbol: Symbol,
        params: PredictionParams,
        cancel: &CancelToken,
    ) -> PredictionStream {
        self.pipeline.predict_once(symbol, params, cancel)
    }

    pub async fn scan(&self, symbols: Vec<Symbol>, params: PredictionParams) -> ScanReport {
        self.scan_with(symbols, params, &self.root.child()).await
    }

    /// Like [`scan`](Self::scan), under a caller-owned token
    pub async fn scan_with(
        &self,
        symbols: Vec<Symbol>,
        params: PredictionParams,
        cancel: &CancelToken,
    ) -> ScanReport {
        self.scanner.scan(ScanJob::new(symbols, params), cancel).await
    }

    pub fn invalidate_cache(&self, scope: &InvalidationScope) -> usize {
        self.pipeline.cache().invalidate(scope)
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.pipeline.broadcaster().subscribe(topic)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.pipeline.broadcaster().unsubscribe(subscription.id())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.pipeline.cache().stats()
    }

    pub fn pipeline(&self) -> &Arc<PredictionPipeline> {
        &self.pipeline
    }

    pub fn broadcaster(&self) -> &StreamBroadcaster {
        self.pipeline.broadcaster()
    }

    pub fn cache(&self) -> &PredictionCache {
        self.pipeline.cache()
    }

    /// Cancels in-flight work and waits for the background services to stop
    pub async fn shutdown(self) {
        info!("Initiating Graceful Shutdown Sequence...");
        self.root.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Shutdown sequence completed.");
    }
}
