use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::{Clock, LocalClock, OffsetClock, RatemeshError, ReferenceClock};

/// Reference reporting system time shifted by a fixed skew; can be made
/// unreachable.
struct FakeReference {
    skew_ms: i64,
    unreachable: AtomicBool,
}

impl FakeReference {
    fn new(skew_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            skew_ms,
            unreachable: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl ReferenceClock for FakeReference {
    async fn reference_time(&self) -> Result<DateTime<Utc>, RatemeshError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RatemeshError::ClockReference(
                "reference unreachable".to_string(),
            ));
        }

        Ok(Utc::now() + TimeDelta::milliseconds(self.skew_ms))
    }
}

async fn wait_for_refresh(clock: &OffsetClock, expected_ms: i64) {
    for _ in 0..100 {
        if (clock.offset().num_milliseconds() - expected_ms).abs() < 100 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "offset never converged, got {} ms",
        clock.offset().num_milliseconds()
    );
}

#[test]
fn local_clock_tracks_system_time() {
    let clock = LocalClock;
    let delta = clock.now() - Utc::now();
    assert!(delta.num_milliseconds().abs() < 100);
}

#[tokio::test]
async fn offset_clock_applies_reference_skew() {
    let reference = FakeReference::new(5_000);
    let cancel = CancellationToken::new();

    let clock = OffsetClock::start(reference, Duration::from_millis(20), cancel.clone());
    wait_for_refresh(&clock, 5_000).await;

    let skew = clock.now() - Utc::now();
    assert!(
        (4_900..=5_100).contains(&skew.num_milliseconds()),
        "skew = {} ms",
        skew.num_milliseconds()
    );

    cancel.cancel();
}

#[tokio::test]
async fn offset_survives_reference_becoming_unreachable() {
    let reference = FakeReference::new(5_000);
    let cancel = CancellationToken::new();

    let clock = OffsetClock::start(reference.clone(), Duration::from_millis(20), cancel.clone());
    wait_for_refresh(&clock, 5_000).await;

    reference.unreachable.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Failed refreshes keep the last known delta.
    let skew = clock.now() - Utc::now();
    assert!(
        (4_900..=5_100).contains(&skew.num_milliseconds()),
        "skew = {} ms",
        skew.num_milliseconds()
    );

    cancel.cancel();
}

#[tokio::test]
async fn cancellation_stops_refreshing() {
    let reference = FakeReference::new(1_000);
    let cancel = CancellationToken::new();

    let clock = OffsetClock::start(reference.clone(), Duration::from_millis(20), cancel.clone());
    wait_for_refresh(&clock, 1_000).await;

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Refreshes have stopped; a changed reference is never picked up.
    reference.unreachable.store(true, Ordering::SeqCst);
    let before = clock.offset();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(before, clock.offset());
}

#[tokio::test]
async fn readings_never_block_on_the_reference() {
    // A reference that would hang forever; now() must still answer because
    // refreshes happen on the background cadence only.
    struct HangingReference;

    #[async_trait::async_trait]
    impl ReferenceClock for HangingReference {
        async fn reference_time(&self) -> Result<DateTime<Utc>, RatemeshError> {
            futures::future::pending().await
        }
    }

    let cancel = CancellationToken::new();
    let clock = OffsetClock::start(
        Arc::new(HangingReference),
        Duration::from_secs(60),
        cancel.clone(),
    );

    let started = std::time::Instant::now();
    let _ = clock.now();
    assert!(started.elapsed() < Duration::from_millis(50));

    cancel.cancel();
}
