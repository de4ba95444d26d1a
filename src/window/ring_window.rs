use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{RateLimitInfo, SlidingWindow};

/// Sliding-window counter over a fixed cyclic buffer of timestamps.
///
/// The slot under the write cursor is the candidate oldest retained entry:
/// the window is full exactly when that slot holds a timestamp still inside
/// the window. Every record overwrites the cursor slot and advances the
/// cursor, so each operation is O(1) and at most `limit` timestamps are
/// retained.
///
/// The fullness test assumes records arrive in approximately non-decreasing
/// time order. When remote events arrive out of order, a newer record can
/// overwrite a slot holding an older-but-still-in-window timestamp, which
/// briefly over-counts the available capacity. That approximation is the
/// price of the O(1) fast path; use [`HeapWindow`](crate::HeapWindow) where
/// ordering cannot be assumed.
#[derive(Debug, Clone)]
pub struct RingWindow {
    slots: Vec<Option<DateTime<Utc>>>,
    cursor: usize,
    window: Duration,
    window_delta: TimeDelta,
}

impl RingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            slots: vec![None; limit],
            cursor: 0,
            window,
            window_delta: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// A zero-capacity or zero-window ring can never admit anything.
    fn degenerate(&self) -> bool {
        self.slots.is_empty() || self.window.is_zero()
    }

    fn is_full(&self, now: DateTime<Utc>) -> bool {
        let oldest_allowed = now - self.window_delta;

        match self.slots[self.cursor] {
            Some(oldest) => oldest >= oldest_allowed,
            None => false,
        }
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.slots[self.cursor] = Some(now);
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    fn info_at(&self, now: DateTime<Utc>) -> RateLimitInfo {
        let oldest_allowed = now - self.window_delta;

        let remaining = self
            .slots
            .iter()
            .filter(|slot| match slot {
                None => true,
                Some(timestamp) => *timestamp < oldest_allowed,
            })
            .count();

        let reset = match self.slots[self.cursor] {
            Some(oldest) if oldest >= oldest_allowed => ((oldest + self.window_delta) - now)
                .to_std()
                .unwrap_or_default(),
            _ => Duration::ZERO,
        };

        RateLimitInfo {
            limit: self.slots.len(),
            remaining,
            reset,
            window: self.window,
        }
    } // end method info_at
}

impl SlidingWindow for RingWindow {
    fn try_accept(&mut self, now: DateTime<Utc>) -> bool {
        if self.degenerate() || self.is_full(now) {
            return false;
        }

        self.record(now);
        true
    }

    fn accept(&mut self, now: DateTime<Utc>) {
        if self.degenerate() {
            return;
        }

        self.record(now);
    }

    fn try_accept_with_info(&mut self, now: DateTime<Utc>) -> (bool, RateLimitInfo) {
        if self.degenerate() {
            let info = RateLimitInfo {
                limit: self.slots.len(),
                remaining: 0,
                reset: Duration::ZERO,
                window: self.window,
            };
            return (false, info);
        }

        let mut info = self.info_at(now);

        if self.is_full(now) {
            return (false, info);
        }

        self.record(now);
        info.remaining = info.remaining.saturating_sub(1);

        (true, info)
    } // end method try_accept_with_info

    fn limit_details(&self) -> (usize, Duration) {
        (self.slots.len(), self.window)
    }
}
