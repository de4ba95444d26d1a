use std::{cmp::Reverse, collections::BinaryHeap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{RateLimitInfo, SlidingWindow};

/// Sliding-window counter over a min-heap of timestamps.
///
/// Every observation first evicts entries older than `now - window` from the
/// root, so fullness is exact regardless of arrival order. The backing array
/// expands lazily and retained size never exceeds `limit`: an unconditional
/// record at capacity discards the root so the newest evidence wins.
#[derive(Debug, Clone)]
pub struct HeapWindow {
    heap: BinaryHeap<Reverse<DateTime<Utc>>>,
    limit: usize,
    window: Duration,
    window_delta: TimeDelta,
}

impl HeapWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            limit,
            window,
            window_delta: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    fn degenerate(&self) -> bool {
        self.limit == 0 || self.window.is_zero()
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(root)) = self.heap.peek() {
            if now - *root > self.window_delta {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// Time until the root leaves the window; `window` when empty.
    fn reset_at(&self, now: DateTime<Utc>) -> Duration {
        match self.heap.peek() {
            Some(Reverse(root)) => ((*root + self.window_delta) - now)
                .to_std()
                .unwrap_or_default(),
            None => self.window,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

impl SlidingWindow for HeapWindow {
    fn try_accept(&mut self, now: DateTime<Utc>) -> bool {
        if self.degenerate() {
            return false;
        }

        self.evict_expired(now);

        if self.heap.len() >= self.limit {
            return false;
        }

        self.heap.push(Reverse(now));
        true
    } // end method try_accept

    fn accept(&mut self, now: DateTime<Utc>) {
        if self.degenerate() {
            return;
        }

        self.evict_expired(now);

        // At capacity the oldest entry gives way; size stays bounded by the
        // limit even under duplicate delivery.
        if self.heap.len() >= self.limit {
            self.heap.pop();
        }

        self.heap.push(Reverse(now));
    } // end method accept

    fn try_accept_with_info(&mut self, now: DateTime<Utc>) -> (bool, RateLimitInfo) {
        if self.degenerate() {
            let info = RateLimitInfo {
                limit: self.limit,
                remaining: 0,
                reset: Duration::ZERO,
                window: self.window,
            };
            return (false, info);
        }

        self.evict_expired(now);

        let mut info = RateLimitInfo {
            limit: self.limit,
            remaining: self.limit.saturating_sub(self.heap.len()),
            reset: Duration::ZERO,
            window: self.window,
        };

        if info.remaining == 0 {
            info.reset = self.reset_at(now);
            return (false, info);
        }

        self.heap.push(Reverse(now));
        info.remaining -= 1;
        info.reset = self.reset_at(now);

        (true, info)
    } // end method try_accept_with_info

    fn limit_details(&self) -> (usize, Duration) {
        (self.limit, self.window)
    }
}
