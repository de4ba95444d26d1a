//! Message-transport abstraction and its implementations.
//!
//! The decision engine depends only on [`MessageBroker`]: a non-blocking
//! publish enqueue plus a long-running consumer loop that hands every decoded
//! event to a handler. Implementations must deliver each instance's events to
//! all subscribers in per-publisher FIFO order, at least once; duplicates and
//! losses are tolerated by the window semantics.

mod memory_broker;
pub use memory_broker::*;

#[cfg(feature = "redis-broker")]
mod redis_broker;
#[cfg(feature = "redis-broker")]
pub use redis_broker::*;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{RateEvent, RatemeshError};

/// Callback invoked once per decoded event; must be cheap and non-blocking.
pub type EventHandler = Arc<dyn Fn(RateEvent) + Send + Sync>;

/// A message transport connecting cooperating limiter instances.
#[async_trait::async_trait]
pub trait MessageBroker: Send + Sync {
    /// Enqueue `event` for transmission.
    ///
    /// Never blocks the caller: when the transport cannot take the event
    /// right now the event is dropped and an error returned. Callers on the
    /// decision path log the error and carry on.
    fn publish(&self, event: RateEvent) -> Result<(), RatemeshError>;

    /// Run the transport until `cancel` fires, invoking `handler` once per
    /// decoded event.
    ///
    /// Returns promptly after cancellation, even while blocked on a read.
    async fn start(
        &self,
        cancel: CancellationToken,
        handler: EventHandler,
    ) -> Result<(), RatemeshError>;
}
