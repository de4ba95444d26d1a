use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::{MemoryHub, MessageBroker};
use crate::{
    EventKind, MaxRequests, RateBatch, RateEvent, RateLimiter, RateLimiterOptions, WindowDuration,
    WindowKind,
};

fn hub_limiter(
    hub: &MemoryHub,
    max_requests: usize,
    window: Duration,
    kind: WindowKind,
) -> Arc<RateLimiter> {
    let broker: Arc<dyn MessageBroker> = Arc::new(hub.broker());

    RateLimiter::new(RateLimiterOptions {
        max_requests: MaxRequests::try_from(max_requests).unwrap(),
        window: WindowDuration::try_from(window).unwrap(),
        window_kind: kind,
        broker: Some(broker),
        ..RateLimiterOptions::default()
    })
    .unwrap()
}

fn preload_batch(count: usize, key: &str) -> RateBatch {
    let now = Utc::now();
    let events = (0..count)
        .map(|i| RateEvent::accepted(format!("synthetic-broker-{i}"), now, key))
        .collect();
    RateBatch::new(events)
}

async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Run the literal twenty-requests-at-20ms pattern and count denials.
async fn run_spaced_requests(limiter: &RateLimiter, key: &str) -> usize {
    let mut denied = 0;
    for _ in 0..20 {
        if !limiter.try_accept(key) {
            denied += 1;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    denied
}

#[tokio::test]
async fn preloaded_stream_saturates_the_local_view() {
    let hub = MemoryHub::new();
    let limiter = hub_limiter(&hub, 5, Duration::from_secs(5), WindowKind::Ring);

    let cancel = CancellationToken::new();
    limiter.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    hub.inject(preload_batch(20, "user1"));
    assert!(
        eventually(Duration::from_secs(1), || limiter
            .cache()
            .get("user1")
            .is_some())
        .await,
        "preloaded events never reached the consumer"
    );

    let denied = run_spaced_requests(&limiter, "user1").await;
    assert_eq!(denied, 20);

    cancel.cancel();
}

#[tokio::test]
async fn partial_preload_consumes_part_of_the_capacity() {
    let hub = MemoryHub::new();
    let limiter = hub_limiter(&hub, 5, Duration::from_secs(5), WindowKind::Ring);

    let cancel = CancellationToken::new();
    limiter.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    hub.inject(preload_batch(2, "user1"));
    assert!(
        eventually(Duration::from_secs(1), || limiter
            .cache()
            .get("user1")
            .is_some())
        .await
    );

    // Two of five slots are taken by remote history: three acceptances left.
    let denied = run_spaced_requests(&limiter, "user1").await;
    assert_eq!(denied, 17);

    cancel.cancel();
}

#[tokio::test]
async fn partial_preload_with_heap_window() {
    let hub = MemoryHub::new();
    let limiter = hub_limiter(&hub, 5, Duration::from_secs(5), WindowKind::Heap);

    let cancel = CancellationToken::new();
    limiter.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    hub.inject(preload_batch(2, "user1"));
    assert!(
        eventually(Duration::from_secs(1), || limiter
            .cache()
            .get("user1")
            .is_some())
        .await
    );

    let denied = run_spaced_requests(&limiter, "user1").await;
    assert_eq!(denied, 17);

    cancel.cancel();
}

#[tokio::test]
async fn acceptances_propagate_to_peer_instances() {
    let hub = MemoryHub::new();
    let a = hub_limiter(&hub, 5, Duration::from_secs(30), WindowKind::Heap);
    let b = hub_limiter(&hub, 5, Duration::from_secs(30), WindowKind::Heap);

    let cancel = CancellationToken::new();
    a.start(cancel.clone());
    b.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Saturate through instance A.
    for _ in 0..5 {
        assert!(a.try_accept("user1"));
    }
    assert!(!a.try_accept("user1"));

    // B converges on the same view and denies without having seen a single
    // local request for the key before.
    let converged = eventually(Duration::from_secs(2), || !b.try_accept("user1")).await;
    assert!(converged, "instance B never converged on A's usage");

    cancel.cancel();
}

#[tokio::test]
async fn echoed_self_events_are_suppressed() {
    let hub = MemoryHub::new();
    let limiter = hub_limiter(&hub, 5, Duration::from_secs(30), WindowKind::Heap);

    let cancel = CancellationToken::new();
    limiter.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..3 {
        assert!(limiter.try_accept("user1"));
    }

    // The hub echoes everything back, including our own events; give the
    // consumer ample time to fold them if it (wrongly) would.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Counting the echoes would have pushed usage to six and denied here.
    assert!(limiter.try_accept("user1"));
    assert!(limiter.try_accept("user1"));
    assert!(!limiter.try_accept("user1"));

    cancel.cancel();
}

#[tokio::test]
async fn stale_remote_events_are_discarded() {
    let hub = MemoryHub::new();
    let limiter = hub_limiter(&hub, 5, Duration::from_secs(2), WindowKind::Heap);

    let cancel = CancellationToken::new();
    limiter.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let now = Utc::now();
    let stale = RateEvent::accepted("peer", now - TimeDelta::seconds(3), "user1");
    let fresh = RateEvent::accepted("peer", now, "user1");
    hub.inject(RateBatch::new(vec![stale, fresh]));

    assert!(
        eventually(Duration::from_secs(1), || limiter
            .cache()
            .get("user1")
            .is_some())
        .await
    );

    // Only the fresh event counted: one slot used remotely, one taken now.
    let (allowed, info) = limiter.try_accept_with_info("user1");
    assert!(allowed);
    assert_eq!(info.remaining, 3);

    cancel.cancel();
}

#[tokio::test]
async fn unknown_event_kinds_are_ignored() {
    let hub = MemoryHub::new();
    let limiter = hub_limiter(&hub, 5, Duration::from_secs(30), WindowKind::Heap);

    let cancel = CancellationToken::new();
    limiter.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let now = Utc::now();
    let unknown = RateEvent {
        broker_id: "peer".to_string(),
        event: EventKind::Unknown,
        timestamp: now,
        key: "user1".to_string(),
    };
    let accepted = RateEvent::accepted("peer", now, "user1");
    hub.inject(RateBatch::new(vec![unknown, accepted]));

    assert!(
        eventually(Duration::from_secs(1), || limiter
            .cache()
            .get("user1")
            .is_some())
        .await
    );

    let (allowed, info) = limiter.try_accept_with_info("user1");
    assert!(allowed);
    assert_eq!(info.remaining, 3);

    cancel.cancel();
}

#[tokio::test]
async fn cancellation_unblocks_a_waiting_consumer() {
    let hub = MemoryHub::new();
    let broker = hub.broker();
    let cancel = CancellationToken::new();

    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { broker.start(cancel, Arc::new(|_| {})).await }
    });

    // Let the consumer reach its blocking read.
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_millis(100), handle)
        .await
        .expect("start did not return within 100ms of cancellation")
        .expect("consumer task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn publish_without_subscribers_is_not_an_error() {
    let hub = MemoryHub::new();
    let broker = hub.broker();

    let event = RateEvent::accepted("solo", Utc::now(), "user1");
    assert!(broker.publish(event).is_ok());
}
