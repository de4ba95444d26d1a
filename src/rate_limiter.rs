use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    Clock, EventKind, LocalClock, MaxRequests, RateEvent, RateLimitInfo, RatemeshError,
    SlidingWindow, WindowCache, WindowDuration, WindowFactory, WindowKind,
    broker::{EventHandler, MessageBroker},
};

/// Configuration for a [`RateLimiter`].
///
/// Every field has a usable default; a limiter built from
/// `RateLimiterOptions::default()` enforces 30 requests per 10 seconds with a
/// ring window and no broker.
pub struct RateLimiterOptions {
    /// Maximum acceptances within any window.
    pub max_requests: MaxRequests,
    /// Sliding window duration.
    pub window: WindowDuration,
    /// Which window variant to build per key.
    pub window_kind: WindowKind,
    /// Overrides `window_kind` with a custom window constructor.
    pub window_factory: Option<WindowFactory>,
    /// Identity attached to published events; defaults to a fresh random id
    /// per process so echoed self-events can be suppressed.
    pub broker_id: Option<String>,
    /// Observation time source; defaults to the system clock.
    pub clock: Option<Arc<dyn Clock>>,
    /// Message transport shared with peer instances; without one the limiter
    /// is purely local.
    pub broker: Option<Arc<dyn MessageBroker>>,
    /// Maximum number of keys tracked at once.
    pub cache_capacity: usize,
    /// Idle lifetime of a tracked key.
    pub cache_ttl: Duration,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            max_requests: MaxRequests::default(),
            window: WindowDuration::default(),
            window_kind: WindowKind::default(),
            window_factory: None,
            broker_id: None,
            clock: None,
            broker: None,
            cache_capacity: 1_000_000,
            cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// The decision engine: answers "may this request proceed now?" from local
/// state, then gossips acceptances to peers through the configured broker.
///
/// Decisions are synchronous and never wait on the network; publishing is a
/// non-blocking enqueue whose failure is logged and does not affect the
/// decision already made. Remote events are folded back into local windows by
/// the consumer started via [`start`](RateLimiter::start).
pub struct RateLimiter {
    id: String,
    max_requests: MaxRequests,
    window: WindowDuration,
    window_delta: TimeDelta,
    cache: WindowCache,
    clock: Arc<dyn Clock>,
    broker: Option<Arc<dyn MessageBroker>>,
    factory: WindowFactory,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Result<Arc<Self>, RatemeshError> {
        if options.cache_capacity == 0 {
            return Err(RatemeshError::InvalidConfig(
                "cache_capacity must be greater than zero".to_string(),
            ));
        }
        if options.cache_ttl.is_zero() {
            return Err(RatemeshError::InvalidConfig(
                "cache_ttl must be greater than zero".to_string(),
            ));
        }

        let factory = options
            .window_factory
            .unwrap_or_else(|| options.window_kind.factory());

        Ok(Arc::new(Self {
            id: options
                .broker_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            max_requests: options.max_requests,
            window: options.window,
            window_delta: TimeDelta::from_std(*options.window).unwrap_or(TimeDelta::MAX),
            cache: WindowCache::new(options.cache_capacity, options.cache_ttl),
            clock: options.clock.unwrap_or_else(|| Arc::new(LocalClock)),
            broker: options.broker,
            factory,
        }))
    } // end constructor

    /// The opaque identity attached to events this instance publishes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration readout: `(capacity, window)`.
    pub fn limit_details(&self) -> (usize, Duration) {
        (*self.max_requests, *self.window)
    }

    /// Begin consuming remote events, iff a broker is configured.
    ///
    /// Without a broker this is a no-op: there is nothing to consume and the
    /// limiter keeps enforcing its purely local view.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let Some(broker) = self.broker.clone() else {
            return;
        };

        let limiter = Arc::downgrade(self);

        let handler: EventHandler = Arc::new(move |event| {
            let Some(limiter) = limiter.upgrade() else {
                return;
            };

            limiter.fold_remote(event);
        });

        tokio::spawn(async move {
            if let Err(err) = broker.start(cancel, handler).await {
                tracing::error!(error = %err, "message broker stopped unexpectedly");
            }
        });
    } // end method start

    /// Check the request identified by `key` against the current local view
    /// and, on acceptance, gossip it to peers.
    ///
    /// Returns within counter-plus-cache cost regardless of broker health.
    pub fn try_accept(&self, key: &str) -> bool {
        let now = self.clock.now();
        let entry = self.cache.get_or_create(key, || self.new_window());

        let allowed = entry.lock().try_accept(now);

        if allowed {
            self.publish_accepted(now, key);
        }

        allowed
    }

    /// As [`try_accept`](RateLimiter::try_accept), plus a snapshot of the
    /// post-decision window state.
    pub fn try_accept_with_info(&self, key: &str) -> (bool, RateLimitInfo) {
        let now = self.clock.now();
        let entry = self.cache.get_or_create(key, || self.new_window());

        let (allowed, info) = entry.lock().try_accept_with_info(now);

        if allowed {
            self.publish_accepted(now, key);
        }

        (allowed, info)
    }

    /// Fold a remote event into the local view.
    ///
    /// Self-originated events are discarded (the decision path already
    /// recorded them), as are events too old to affect fullness. Everything
    /// else is recorded unconditionally at the originator's timestamp: the
    /// remote instance made an authoritative decision and the local window
    /// must not second-guess it.
    fn fold_remote(&self, event: RateEvent) {
        if event.event != EventKind::RequestAccepted {
            return;
        }

        if event.broker_id == self.id {
            return;
        }

        let now = self.clock.now();
        if event.timestamp < now - self.window_delta {
            return;
        }

        let entry = self.cache.get_or_create(&event.key, || self.new_window());
        entry.lock().accept(event.timestamp);
    } // end method fold_remote

    fn publish_accepted(&self, now: chrono::DateTime<chrono::Utc>, key: &str) {
        let Some(broker) = &self.broker else {
            return;
        };

        let event = RateEvent::accepted(self.id.clone(), now, key);

        if let Err(err) = broker.publish(event) {
            tracing::error!(error = %err, key, "failed to enqueue rate event for publishing");
        }
    }

    fn new_window(&self) -> Box<dyn SlidingWindow> {
        (self.factory)(*self.max_requests, *self.window)
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &WindowCache {
        &self.cache
    }
}
