//! Dispatch strategy behavior over in-process mock backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockBackend;
use ensemble::consensus::{ConsensusConfig, ConsensusStrategy};
use ensemble::dispatcher::{Dispatcher, Strategy};
use ensemble::error::{Error, ErrorKind};
use ensemble::{Backend, CallOption, Message};
use serde_json::json;

fn consensus(strategy: ConsensusStrategy, threshold: f64) -> ConsensusConfig {
    ConsensusConfig {
        strategy,
        similarity_threshold: threshold,
    }
}

#[tokio::test]
async fn fastest_picks_the_fast_backend() {
    let slow = Arc::new(MockBackend::replying("slow", "Slow").with_delay(Duration::from_millis(30)));
    let fast = Arc::new(MockBackend::replying("fast", "Fast").with_delay(Duration::from_millis(10)));

    let dispatcher = Dispatcher::builder()
        .backend(slow.clone())
        .backend(fast.clone())
        .strategy(Strategy::Fastest)
        .build()
        .unwrap();

    let result = dispatcher.generate("prompt", &[]).await.unwrap();
    assert_eq!(result, "Fast");
}

#[tokio::test]
async fn primary_short_circuits_the_secondary() {
    let primary = Arc::new(MockBackend::replying("primary", "P"));
    let secondary = Arc::new(MockBackend::replying("secondary", "S"));

    let dispatcher = Dispatcher::builder()
        .backend(primary.clone())
        .backend(secondary.clone())
        .strategy(Strategy::Primary)
        .build()
        .unwrap();

    let result = dispatcher.generate("prompt", &[]).await.unwrap();
    assert_eq!(result, "P");
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 0);
}

#[tokio::test]
async fn primary_falls_back_on_error() {
    let failing = Arc::new(MockBackend::deadline("failing"));
    let good = Arc::new(MockBackend::replying("good", "G"));

    let dispatcher = Dispatcher::builder()
        .backend(failing.clone())
        .backend(good.clone())
        .strategy(Strategy::Primary)
        .build()
        .unwrap();

    let result = dispatcher.generate("prompt", &[]).await.unwrap();
    assert_eq!(result, "G");
    assert_eq!(failing.calls(), 1);
    assert_eq!(good.calls(), 1);
}

#[tokio::test]
async fn primary_order_starts_at_the_primary_index_and_wraps() {
    let a = Arc::new(MockBackend::replying("a", "A"));
    let b = Arc::new(MockBackend::replying("b", "B"));
    let c = Arc::new(MockBackend::failing("c", ErrorKind::Unavailable));

    let dispatcher = Dispatcher::builder()
        .backend(a.clone())
        .backend(b.clone())
        .backend(c.clone())
        .strategy(Strategy::Primary)
        .primary(2)
        .build()
        .unwrap();

    let result = dispatcher.generate("prompt", &[]).await.unwrap();
    assert_eq!(result, "A");
    assert_eq!(c.calls(), 1);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0);
}

fn capital_backends(berlin_weight: f64) -> (Vec<Arc<MockBackend>>, Dispatcher, Dispatcher, Dispatcher) {
    let backends: Vec<Arc<MockBackend>> = vec![
        Arc::new(MockBackend::replying("one", "The capital of France is Paris.")),
        Arc::new(MockBackend::replying("two", "Paris is the capital city of France.")),
        Arc::new(MockBackend::replying("three", "The capital of France is Paris.")),
        Arc::new(MockBackend::replying("four", "France's capital city is Paris.")),
        Arc::new(MockBackend::replying("five", "Berlin is the capital of Germany.")),
    ];

    let mut majority = Dispatcher::builder()
        .strategy(Strategy::Consensus)
        .consensus(consensus(ConsensusStrategy::Majority, 0.6));
    let mut weighted = Dispatcher::builder()
        .strategy(Strategy::Consensus)
        .consensus(consensus(ConsensusStrategy::Weighted, 0.6));
    let mut similarity = Dispatcher::builder()
        .strategy(Strategy::Consensus)
        .consensus(consensus(ConsensusStrategy::Similarity, 0.6));

    for (i, backend) in backends.iter().enumerate() {
        let weight = if i == 4 { berlin_weight } else { 1.0 };
        majority = majority.weighted_backend(backend.clone(), weight);
        weighted = weighted.weighted_backend(backend.clone(), weight);
        similarity = similarity.weighted_backend(backend.clone(), weight);
    }

    (
        backends,
        majority.build().unwrap(),
        weighted.build().unwrap(),
        similarity.build().unwrap(),
    )
}

#[tokio::test]
async fn majority_consensus_picks_the_repeated_answer() {
    let (_, majority, _, _) = capital_backends(1.0);
    let result = majority.generate("capital?", &[]).await.unwrap();
    assert_eq!(result, "The capital of France is Paris.");
}

#[tokio::test]
async fn weighted_consensus_rejects_the_low_weight_outlier() {
    let (_, _, weighted, _) = capital_backends(0.5);
    let result = weighted.generate("capital?", &[]).await.unwrap();
    assert!(result.contains("Paris"));
    assert!(result.contains("France"));
    assert!(!result.contains("Berlin"));
    assert!(!result.contains("Germany"));
}

#[tokio::test]
async fn similarity_consensus_stays_in_the_majority_group() {
    let (_, _, _, similarity) = capital_backends(1.0);
    let result = similarity.generate("capital?", &[]).await.unwrap();
    assert!(result.contains("Paris"));
    assert!(!result.contains("Berlin"));
}

#[tokio::test]
async fn empty_backend_list_is_rejected_without_any_work() {
    let dispatcher = Dispatcher::builder().build().unwrap();

    assert!(matches!(
        dispatcher.generate("p", &[]).await.unwrap_err(),
        Error::NoBackends
    ));
    assert!(matches!(
        dispatcher
            .generate_message(&[Message::user("p")], &[])
            .await
            .unwrap_err(),
        Error::NoBackends
    ));
    assert!(matches!(
        dispatcher
            .generate_with_schema("p", &json!({"type": "object"}), &[])
            .await
            .unwrap_err(),
        Error::NoBackends
    ));
    assert!(matches!(
        dispatcher.stream("p", &[]).await.unwrap_err(),
        Error::NoBackends
    ));
    assert!(matches!(
        dispatcher
            .stream_message(&[Message::user("p")], &[])
            .await
            .unwrap_err(),
        Error::NoBackends
    ));
}

#[tokio::test]
async fn total_failure_aggregates_every_backend_error() {
    let limited = Arc::new(MockBackend::failing("limited", ErrorKind::RateLimited));
    let down = Arc::new(MockBackend::failing("down", ErrorKind::Unavailable));

    let dispatcher = Dispatcher::builder()
        .backend(limited)
        .backend(down)
        .strategy(Strategy::Fastest)
        .build()
        .unwrap();

    let err = dispatcher.generate("prompt", &[]).await.unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("no successful calls"));
    assert!(rendered.contains("limited"));
    assert!(rendered.contains("down"));
    // The sentinel kinds stay matchable through the aggregate.
    assert!(err.is_rate_limited());
    assert!(err.matches(ErrorKind::Unavailable));
    assert!(!err.is_authentication());
}

#[tokio::test]
async fn expired_deadline_surfaces_a_deadline_error() {
    let slow = Arc::new(MockBackend::replying("slow", "late").with_delay(Duration::from_millis(200)));

    let dispatcher = Dispatcher::builder()
        .backend(slow)
        .strategy(Strategy::Fastest)
        .build()
        .unwrap();

    let err = dispatcher
        .generate("prompt", &[CallOption::Timeout(Duration::ZERO)])
        .await
        .unwrap_err();

    match err {
        Error::AllFailed(agg) => {
            assert!(agg
                .failures
                .iter()
                .any(|(_, e)| matches!(e, Error::DeadlineExceeded)));
        }
        other => panic!("expected aggregate failure, got {other}"),
    }
}

#[tokio::test]
async fn structured_consensus_agrees_across_key_order() {
    let a = Arc::new(MockBackend::replying(
        "a",
        r#"{"city": "Paris", "country": "France"}"#,
    ));
    let b = Arc::new(MockBackend::replying(
        "b",
        r#"{"country": "France", "city": "Paris"}"#,
    ));
    let c = Arc::new(MockBackend::replying("c", r#"{"city": "Berlin"}"#));

    let dispatcher = Dispatcher::builder()
        .backend(a)
        .backend(b)
        .backend(c)
        .strategy(Strategy::Consensus)
        .consensus(consensus(ConsensusStrategy::Majority, 0.6))
        .build()
        .unwrap();

    let value = dispatcher
        .generate_with_schema("where?", &json!({"type": "object"}), &[])
        .await
        .unwrap();
    assert_eq!(value, json!({"city": "Paris", "country": "France"}));
}

#[tokio::test]
async fn consensus_with_single_success_returns_it() {
    let good = Arc::new(MockBackend::replying("good", "only answer"));
    let bad = Arc::new(MockBackend::failing("bad", ErrorKind::Unavailable));

    let dispatcher = Dispatcher::builder()
        .backend(good)
        .backend(bad)
        .strategy(Strategy::Consensus)
        .consensus(consensus(ConsensusStrategy::Weighted, 0.6))
        .build()
        .unwrap();

    let result = dispatcher.generate("prompt", &[]).await.unwrap();
    assert_eq!(result, "only answer");
}
