use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::SlidingWindow;

/// How many entries an eviction pass samples when picking a victim.
const EVICTION_SAMPLE: usize = 16;

/// A cached per-key window together with its own exclusion and touch time.
///
/// All window mutation goes through [`lock`](CachedWindow::lock); the lock is
/// never held across an await point, so counter operations stay
/// non-suspending.
pub struct CachedWindow {
    window: Mutex<Box<dyn SlidingWindow>>,
    last_touch_ms: AtomicI64,
}

impl CachedWindow {
    fn new(window: Box<dyn SlidingWindow>) -> Self {
        Self {
            window: Mutex::new(window),
            last_touch_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn SlidingWindow>> {
        self.window.lock()
    }

    fn touch(&self, now_ms: i64) {
        self.last_touch_ms.store(now_ms, Ordering::Relaxed);
    }

    fn idle_since(&self, now_ms: i64) -> i64 {
        now_ms - self.last_touch_ms.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CachedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedWindow")
            .field("last_touch_ms", &self.last_touch_ms)
            .finish_non_exhaustive()
    }
}

/// Bounded key → window mapping with idle-TTL and approximate-LRU eviction.
///
/// Evicting an entry is always safe: a missing key behaves identically to one
/// that has never been seen, at the cost of discarding accumulated history.
///
/// Concurrent `get_or_create` calls for the same key return the same window;
/// the factory runs at most once per key per cache lifetime (losers observe
/// the winner's window). The map is shard-locked ([`DashMap`]); eviction picks
/// the least recently touched of a small random sample rather than
/// maintaining a global recency list.
#[derive(Debug)]
pub struct WindowCache {
    entries: DashMap<String, Arc<CachedWindow>>,
    capacity: usize,
    ttl_ms: i64,
}

impl WindowCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Look up the window for `key`, refreshing its TTL.
    ///
    /// An entry idle for longer than the TTL is dropped and reported as
    /// missing.
    pub fn get(&self, key: &str) -> Option<Arc<CachedWindow>> {
        let now_ms = Utc::now().timestamp_millis();

        let entry = self.entries.get(key)?;

        if entry.idle_since(now_ms) >= self.ttl_ms {
            drop(entry);
            self.entries
                .remove_if(key, |_, window| window.idle_since(now_ms) >= self.ttl_ms);
            return None;
        }

        entry.touch(now_ms);
        Some(Arc::clone(entry.value()))
    } // end method get

    /// Look up the window for `key`, creating it with `factory` on miss.
    pub fn get_or_create(
        &self,
        key: &str,
        factory: impl FnOnce() -> Box<dyn SlidingWindow>,
    ) -> Arc<CachedWindow> {
        if let Some(window) = self.get(key) {
            return window;
        }

        if self.entries.len() >= self.capacity {
            self.evict();
        }

        let now_ms = Utc::now().timestamp_millis();

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CachedWindow::new(factory())));

        entry.touch(now_ms);
        Arc::clone(entry.value())
    } // end method get_or_create

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry idle for longer than the TTL.
    pub fn cleanup(&self) {
        let now_ms = Utc::now().timestamp_millis();
        self.entries
            .retain(|_, window| window.idle_since(now_ms) < self.ttl_ms);
    }

    /// Make room for one insertion: expired entries first, then the least
    /// recently touched of a small random sample until under capacity.
    ///
    /// The sample starts at a bounded random offset into the shard iteration,
    /// so a pass inspects O(sample) entries instead of maintaining a global
    /// recency list.
    fn evict(&self) {
        self.cleanup();

        while self.entries.len() >= self.capacity {
            let len = self.entries.len();
            if len == 0 {
                break;
            }

            let skip = rand::random::<u64>() as usize % len.min(1024);

            let victim = self
                .entries
                .iter()
                .skip(skip)
                .take(EVICTION_SAMPLE)
                .min_by_key(|entry| entry.value().last_touch_ms.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());

            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    } // end method evict
}
