//! Per-key sliding-window counters.
//!
//! Two interchangeable variants answer "is the window full at time t?":
//!
//! - [`RingWindow`]: insertion-ordered fixed buffer, O(1) per operation,
//!   tolerates a minor over-count when records arrive out of order
//! - [`HeapWindow`]: timestamp-ordered min-heap, order-insensitive, O(log n)
//!
//! Both honor the window W such that timestamps older than `t - W` never
//! count toward fullness. A window with zero capacity or a zero duration
//! always denies and never records; the engine-level config newtypes reject
//! those values, so such windows are only reachable by constructing the types
//! directly.

mod ring_window;
pub use ring_window::*;

mod heap_window;
pub use heap_window::*;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::RateLimitInfo;

/// The operation set shared by all window variants.
///
/// The time argument is the observation time and is always caller-supplied;
/// windows never consult a clock themselves. Mutation is serialized by the
/// owning cache entry's lock.
pub trait SlidingWindow: Send {
    /// If the window is not full at `now`, record `now` and return `true`;
    /// otherwise return `false` without recording.
    fn try_accept(&mut self, now: DateTime<Utc>) -> bool;

    /// Unconditionally record `now`.
    ///
    /// Used when folding remote events: the originating instance already made
    /// an authoritative decision, so the local view must not second-guess it.
    fn accept(&mut self, now: DateTime<Utc>);

    /// As [`try_accept`](SlidingWindow::try_accept), plus a snapshot of the
    /// post-decision state.
    fn try_accept_with_info(&mut self, now: DateTime<Utc>) -> (bool, RateLimitInfo);

    /// Configuration readout: `(capacity, window)`.
    fn limit_details(&self) -> (usize, Duration);
}

/// Constructor for the window variant used by an engine, selected at build
/// time and passed by value.
pub type WindowFactory = Arc<dyn Fn(usize, Duration) -> Box<dyn SlidingWindow> + Send + Sync>;

/// Built-in window variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowKind {
    /// The fast-path default.
    #[default]
    Ring,
    /// Order-insensitive; higher per-entry cost.
    Heap,
}

impl WindowKind {
    /// A factory producing this variant.
    pub fn factory(self) -> WindowFactory {
        match self {
            WindowKind::Ring => {
                Arc::new(|limit, window| Box::new(RingWindow::new(limit, window)))
            }
            WindowKind::Heap => {
                Arc::new(|limit, window| Box::new(HeapWindow::new(limit, window)))
            }
        }
    }
}
