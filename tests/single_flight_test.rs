mod common;

use chainsight::application::cache::LookupSource;
use chainsight::domain::analysis::prediction::Completeness;
use chainsight::domain::market::Symbol;
use chainsight::infrastructure::mock::{
    MockInferenceProvider, MockMarketDataProvider, ResponseBehavior,
};
use futures::future::join_all;
use std::time::Duration;

fn eth() -> Symbol {
    Symbol::parse("ETHUSDT").unwrap()
}

#[tokio::test]
async fn test_concurrent_requests_share_one_computation() {
    let harness = common::start(
        common::test_config(),
        MockMarketDataProvider::new().with_latency(Duration::from_millis(50)),
        MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(5)),
    );
    let handle = &harness.handle;

    let requests = (0..10).map(|_| {
        handle
            .predict_once(eth(), handle.default_params())
            .collect_result()
    });
    let lookups: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|r| tokio_test::assert_ok!(r))
        .collect();

    assert_eq!(harness.market.snapshot_calls(&eth()), 1);
    assert_eq!(harness.llm.open_calls(), 1);

    let computed = lookups
        .iter()
        .filter(|l| l.source == LookupSource::Computed)
        .count();
    assert_eq!(computed, 1);
    assert!(
        lookups
            .iter()
            .all(|l| l.result.context_fingerprint == lookups[0].result.context_fingerprint)
    );

    let stats = harness.handle.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.joins + stats.hits, 9);
    assert_eq!(stats.in_flight, 0);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_failure_is_shared_but_not_cached() {
    let llm = MockInferenceProvider::new().with_chunk_delay(Duration::from_millis(5));
    llm.push_behavior(ResponseBehavior::Reject("overloaded".to_string()));
    let harness = common::start(
        common::test_config(),
        MockMarketDataProvider::new().with_latency(Duration::from_millis(50)),
        llm,
    );
    let handle = &harness.handle;

    let requests = (0..4).map(|_| {
        handle
            .predict_once(eth(), handle.default_params())
            .collect_result()
    });
    let outcomes = join_all(requests).await;
    assert!(outcomes.iter().all(|o| o.is_err()));
    assert_eq!(harness.llm.open_calls(), 1);

    // the failure left nothing behind; the next call starts over
    let lookup = handle
        .predict_once(eth(), handle.default_params())
        .collect_result()
        .await
        .unwrap();
    assert_eq!(lookup.source, LookupSource::Computed);
    assert_eq!(harness.llm.open_calls(), 2);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_partial_result_is_returned_but_not_cached() {
    let llm = MockInferenceProvider::new();
    llm.push_behavior(ResponseBehavior::InterruptAfter(3));
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), llm);
    let handle = &harness.handle;

    let partial = handle
        .predict_once(eth(), handle.default_params())
        .collect_result()
        .await
        .unwrap();
    assert_eq!(partial.result.completeness, Completeness::Partial);
    assert!(!partial.result.raw_text.is_empty());
    assert_eq!(handle.cache_stats().entries, 0);

    let full = handle
        .predict_once(eth(), handle.default_params())
        .collect_result()
        .await
        .unwrap();
    assert_eq!(full.source, LookupSource::Computed);
    assert_eq!(full.result.completeness, Completeness::Full);
    assert_eq!(handle.cache_stats().entries, 1);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_stream_drop_before_output_retries_once() {
    let llm = MockInferenceProvider::new();
    llm.push_behavior(ResponseBehavior::InterruptAfter(0));
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), llm);

    let lookup = harness
        .handle
        .predict_once(eth(), harness.handle.default_params())
        .collect_result()
        .await
        .unwrap();
    assert_eq!(lookup.result.completeness, Completeness::Full);
    assert_eq!(harness.llm.open_calls(), 2);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn test_repeated_timeouts_fail_the_prediction() {
    let llm = MockInferenceProvider::new();
    llm.push_behavior(ResponseBehavior::TimeoutOnOpen);
    llm.push_behavior(ResponseBehavior::TimeoutOnOpen);
    let harness = common::start(common::test_config(), MockMarketDataProvider::new(), llm);

    let err = harness
        .handle
        .predict_once(eth(), harness.handle.default_params())
        .collect_result()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "inference_failed");
    assert_eq!(harness.llm.open_calls(), 2);

    harness.handle.shutdown().await;
}
