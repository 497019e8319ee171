//! Resilience layer against the mock remote.

mod common;

use std::time::Duration;

use common::{fast_resilience, MockRemote, CONTAINER};
use trellis_engine::LocalItem;
use trellis_sync::{
    now_millis, BatchOptions, CircuitStatus, RateLimitStatus, RemoteClient, RemoteError,
    ResilienceConfig, ResilienceError, ResilienceLayer, ResourceDraft,
};

#[tokio::test]
async fn test_quota_above_buffer_needs_no_wait() {
    let layer = fast_resilience();
    let remote = MockRemote::new();
    remote.set_rate_limit(RateLimitStatus {
        limit: 5000,
        remaining: 4000,
        reset_at: now_millis() + 60_000,
    });

    let check = layer.check_rate_limit(remote.as_ref()).await.unwrap();
    assert!(!check.should_wait());
    assert_eq!(check.status.remaining, 4000);
}

#[tokio::test]
async fn test_low_quota_suggests_clamped_wait() {
    let layer = fast_resilience();
    let remote = MockRemote::new();
    remote.set_rate_limit(RateLimitStatus {
        limit: 5000,
        remaining: 3,
        reset_at: now_millis() + 60_000,
    });

    let check = layer.check_rate_limit(remote.as_ref()).await.unwrap();
    // Clamped to the configured maximum wait
    assert_eq!(check.wait, Some(layer.config().max_rate_limit_wait));
}

#[tokio::test]
async fn test_batch_creates_in_order() {
    let layer = fast_resilience();
    let remote = MockRemote::new();
    remote.fail_next([RemoteError::Status {
        status: 502,
        message: "bad gateway".into(),
    }]);

    let drafts: Vec<ResourceDraft> = ["First", "Second", "Third"]
        .into_iter()
        .enumerate()
        .map(|(i, title)| {
            ResourceDraft::from_item(&LocalItem::new(format!("task-{i}"), title, "pending", 0))
        })
        .collect();
    let operations: Vec<_> = drafts
        .iter()
        .map(|draft| {
            let remote = remote.as_ref();
            move || remote.create_resource(CONTAINER, draft)
        })
        .collect();

    let results = layer
        .execute_batch(
            operations,
            BatchOptions {
                concurrency: 1,
                ..BatchOptions::default()
            },
        )
        .await;

    let titles: Vec<String> = results.into_iter().map(|r| r.unwrap().title).collect();
    assert_eq!(titles, vec!["First", "Second", "Third"]);
    assert_eq!(layer.stats().retries, 1);
    assert_eq!(remote.calls(), 4);
}

#[tokio::test]
async fn test_breaker_protects_failing_remote() {
    let layer = ResilienceLayer::new(ResilienceConfig {
        max_attempts: 1,
        circuit_threshold: 2,
        ..ResilienceConfig::default()
    });
    let remote = MockRemote::new();
    remote.fail_next((0..5).map(|_| RemoteError::Network("timeout".into())));

    for _ in 0..2 {
        let result = layer
            .execute_with_retry(|| remote.get_resource(CONTAINER, 1))
            .await;
        assert!(matches!(result, Err(ResilienceError::RetriesExhausted { .. })));
    }

    let rejected = layer
        .execute_with_retry(|| remote.get_resource(CONTAINER, 1))
        .await;
    assert_eq!(rejected.unwrap_err(), ResilienceError::CircuitOpen);
    assert_eq!(layer.circuit_status().await, CircuitStatus::Open);
    assert_eq!(remote.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_trial_does_not_wedge_breaker() {
    let layer = ResilienceLayer::new(ResilienceConfig {
        max_attempts: 1,
        circuit_threshold: 1,
        circuit_cooldown: Duration::from_secs(30),
        ..ResilienceConfig::default()
    });
    let remote = MockRemote::new();
    remote.fail_next([RemoteError::Network("timeout".into())]);

    let tripped = layer
        .execute_with_retry(|| remote.get_resource(CONTAINER, 1))
        .await;
    assert!(tripped.is_err());
    assert_eq!(layer.circuit_status().await, CircuitStatus::Open);

    tokio::time::advance(Duration::from_secs(30)).await;

    // The trial hangs and its caller times out, dropping it mid-flight
    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        layer.execute_with_retry(std::future::pending::<Result<(), RemoteError>>),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(layer.circuit_status().await, CircuitStatus::HalfOpen);

    let early = layer.execute_with_retry(|| async { Ok(()) }).await;
    assert_eq!(early, Err(ResilienceError::CircuitOpen));

    tokio::time::advance(Duration::from_secs(30)).await;
    let healthy = layer.execute_with_retry(|| async { Ok(()) }).await;
    assert_eq!(healthy, Ok(()));
    assert_eq!(layer.circuit_status().await, CircuitStatus::Closed);
}
