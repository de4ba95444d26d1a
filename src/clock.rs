//! Time sources for observation timestamps.
//!
//! Decisions always operate on caller-supplied time obtained from a [`Clock`],
//! so the engine can run against the system clock, a skew-corrected clock, or
//! a manual clock in tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::RatemeshError;

/// Default cadence for refreshing the skew delta of an [`OffsetClock`].
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Thread-safe wall-clock source.
///
/// Readings must be comparable across process instances: remote event
/// timestamps are folded into local windows, so `now()` is wall time, never a
/// process-local monotonic origin.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// An external time reference an [`OffsetClock`] synchronizes against.
///
/// An NTP client is the expected implementation; anything that can answer
/// "what time is it" works.
#[async_trait::async_trait]
pub trait ReferenceClock: Send + Sync {
    async fn reference_time(&self) -> Result<DateTime<Utc>, RatemeshError>;
}

/// System clock corrected by a cached skew delta.
///
/// The delta is refreshed on a background cadence (default every 60 s) so
/// `now()` never touches the network. A failed refresh keeps the last known
/// delta and logs a warning per attempt; when the last successful refresh is
/// older than twice the refresh interval, the next reading logs a staleness
/// warning once per episode.
#[derive(Debug)]
pub struct OffsetClock {
    offset_ms: AtomicI64,
    last_refresh_ms: AtomicI64,
    refresh_interval_ms: i64,
    stale_logged: AtomicBool,
}

impl OffsetClock {
    /// Spawn the refresh task and return the clock.
    ///
    /// The first refresh happens immediately; afterwards the delta is
    /// refreshed once per `refresh_interval` until `cancel` fires or the
    /// clock is dropped.
    pub fn start(
        reference: Arc<dyn ReferenceClock>,
        refresh_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let interval_ms = i64::try_from(refresh_interval.as_millis()).unwrap_or(i64::MAX);

        let clock = Arc::new(Self {
            offset_ms: AtomicI64::new(0),
            last_refresh_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            refresh_interval_ms: interval_ms,
            stale_logged: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&clock);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(clock) = weak.upgrade() else {
                    break;
                };

                // A hung reference must not outlive cancellation.
                let refreshed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    refreshed = reference.reference_time() => refreshed,
                };

                match refreshed {
                    Ok(reference_now) => {
                        let offset = reference_now - Utc::now();
                        clock
                            .offset_ms
                            .store(offset.num_milliseconds(), Ordering::Relaxed);
                        clock
                            .last_refresh_ms
                            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        clock.stale_logged.store(false, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            "clock reference refresh failed, keeping last known offset"
                        );
                    }
                }
            }
        });

        clock
    } // end method start

    /// The currently cached skew delta.
    pub fn offset(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        let system_now = Utc::now();

        let age_ms = system_now.timestamp_millis() - self.last_refresh_ms.load(Ordering::Relaxed);
        if age_ms > self.refresh_interval_ms.saturating_mul(2)
            && !self.stale_logged.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                stale_ms = age_ms,
                "offset clock delta is stale, readings use the last known offset"
            );
        }

        system_now + TimeDelta::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }
}
