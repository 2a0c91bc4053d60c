mod common;

use chainsight::application::cache::{InvalidationScope, LookupSource};
use chainsight::application::pipeline::PredictionUpdate;
use chainsight::application::streaming::{StreamEvent, Topic};
use chainsight::domain::market::Symbol;
use chainsight::infrastructure::mock::{MockInferenceProvider, MockMarketDataProvider};
use futures::StreamExt;
use std::time::Duration;

fn sol() -> Symbol {
    Symbol::parse("SOL/USDT").unwrap()
}

fn slow_model() -> MockInferenceProvider {
    MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(20))
}

#[tokio::test]
async fn test_dropping_the_only_stream_cancels_the_computation() {
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), slow_model());
    let handle = &harness.handle;
    let mut events = handle.subscribe(Topic::Symbol(sol()));

    let mut stream = handle.predict_once(sol(), handle.default_params());
    match stream.next().await {
        Some(PredictionUpdate::Chunk(_)) => {}
        other => panic!("expected a chunk first, got {:?}", other),
    }
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = handle.cache_stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.entries, 0);

    let pipeline = handle.pipeline();
    let inference = pipeline.inference().limiter();
    assert_eq!(inference.available(), inference.capacity());
    let market = pipeline.source().limiter();
    assert_eq!(market.available(), market.capacity());

    // cancellation is silent: no completion or failure is announced
    while let Some(event) = events.try_recv() {
        assert!(
            !matches!(
                event,
                StreamEvent::PredictionCompleted { .. } | StreamEvent::PredictionFailed { .. }
            ),
            "unexpected {:?}",
            event
        );
    }

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_cancel_after_invalidation_still_releases_the_model() {
    // the full answer takes about a second at this pace
    let llm = MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(60));
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), llm);
    let handle = &harness.handle;

    let mut stream = handle.predict_once(sol(), handle.default_params());
    assert!(matches!(stream.next().await, Some(PredictionUpdate::Chunk(_))));

    handle.invalidate_cache(&InvalidationScope::All);
    drop(stream);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let inference = handle.pipeline().inference().limiter();
    assert_eq!(inference.available(), inference.capacity());
    assert_eq!(handle.cache_stats().entries, 0);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_remaining_waiter_keeps_the_computation_alive() {
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), slow_model());
    let handle = &harness.handle;

    let mut starter = handle.predict_once(sol(), handle.default_params());
    assert!(matches!(starter.next().await, Some(PredictionUpdate::Chunk(_))));

    let joiner = handle.predict_once(sol(), handle.default_params());
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(starter);

    let lookup = joiner.collect_result().await.unwrap();
    assert_eq!(lookup.source, LookupSource::Joined);
    assert_eq!(harness.llm.open_calls(), 1);
    assert_eq!(handle.cache_stats().entries, 1);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_repeated_cancel_cycles_leak_no_permits() {
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), slow_model());
    let handle = &harness.handle;

    for _ in 0..5 {
        let token = handle.root_token().child();
        let mut stream = handle.predict_once_with(sol(), handle.default_params(), &token);
        assert!(matches!(stream.next().await, Some(PredictionUpdate::Chunk(_))));
        token.cancel();
        let err = tokio_test::assert_err!(stream.collect_result().await);
        assert!(err.is_cancelled());
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let limiter = handle.pipeline().inference().limiter();
    assert_eq!(limiter.available(), limiter.capacity());
    assert_eq!(handle.cache_stats().in_flight, 0);
    assert_eq!(harness.llm.open_calls(), 5);

    // the system still serves requests afterwards
    let lookup = tokio_test::assert_ok!(
        handle
            .predict_once(sol(), handle.default_params())
            .collect_result()
            .await
    );
    assert_eq!(lookup.source, LookupSource::Computed);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_requests() {
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), slow_model());

    let mut stream = harness
        .handle
        .predict_once(sol(), harness.handle.default_params());
    assert!(matches!(stream.next().await, Some(PredictionUpdate::Chunk(_))));

    tokio::time::timeout(Duration::from_secs(2), harness.handle.shutdown())
        .await
        .expect("shutdown should not hang");

    let err = stream.collect_result().await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_idle_timeout_before_first_chunk_fails() {
    let mut config = common::test_config();
    config.providers.llm.idle_timeout_ms = 50;
    let harness = common::start(
        config,
        MockMarketDataProvider::new(),
        MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(200)),
    );

    // the first chunk already exceeds the idle limit, so both attempts produce nothing
    let err = harness
        .handle
        .predict_once(sol(), harness.handle.default_params())
        .collect_result()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "inference_failed");
    assert_eq!(harness.llm.open_calls(), 2);

    harness.handle.shutdown().await;
}
