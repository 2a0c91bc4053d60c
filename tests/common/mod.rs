#![allow(dead_code)]

use chainsight::application::system::{Application, SystemHandle};
use chainsight::config::Config;
use chainsight::infrastructure::mock::{MockInferenceProvider, MockMarketDataProvider};
use std::sync::Arc;

pub struct Harness {
    pub handle: SystemHandle,
    pub market: Arc<MockMarketDataProvider>,
    pub llm: Arc<MockInferenceProvider>,
}

/// Mock-mode config with fast retries and no background polling
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.observability.enabled = false;
    config.pipeline.watchlist.clear();
    config.pipeline.fetch_backoff_base_ms = 5;
    config.pipeline.fetch_backoff_max_ms = 20;
    config.pipeline.fetch_backoff_jitter = false;
    config.pipeline.subscriber_buffer = 1024;
    config
}

pub fn start(config: Config, market: MockMarketDataProvider, llm: MockInferenceProvider) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();

    let market = Arc::new(market);
    let llm = Arc::new(llm);
    let app = Application::with_providers(config, market.clone(), llm.clone())
        .expect("application should build");
    Harness {
        handle: app.start(),
        market,
        llm,
    }
}

pub fn start_default() -> Harness {
    start(
        test_config(),
        MockMarketDataProvider::new(),
        MockInferenceProvider::new(),
    )
}
