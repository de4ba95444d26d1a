use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    RateBatch, RateEvent, RatemeshError,
    broker::{EventHandler, MessageBroker},
};

const HUB_CAPACITY: usize = 1024;

/// An in-process stream shared by any number of [`InMemoryBroker`]s.
///
/// Every published event is delivered to every subscriber, including the one
/// that published it, which makes the hub a faithful stand-in for a shared
/// stream: self-event suppression in the consumer handler gets exercised
/// exactly as it would against a real transport.
#[derive(Debug)]
pub struct MemoryHub {
    sender: broadcast::Sender<RateBatch>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    /// A broker attached to this hub.
    pub fn broker(&self) -> InMemoryBroker {
        InMemoryBroker {
            sender: self.sender.clone(),
        }
    }

    /// Inject a batch directly, as another instance would have published it.
    pub fn inject(&self, batch: RateBatch) {
        // No subscriber yet means nobody to deliver to; matches a stream
        // read from the tail.
        let _ = self.sender.send(batch);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Loopback broker backed by a [`MemoryHub`].
///
/// Useful in tests and for exercising multiple engines inside one process
/// without a real transport.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    sender: broadcast::Sender<RateBatch>,
}

#[async_trait::async_trait]
impl MessageBroker for InMemoryBroker {
    fn publish(&self, event: RateEvent) -> Result<(), RatemeshError> {
        // An errored send only means no subscriber is listening; the event
        // would not have been observed by anyone anyway.
        let _ = self.sender.send(RateBatch::from(vec![event]));
        Ok(())
    }

    async fn start(
        &self,
        cancel: CancellationToken,
        handler: EventHandler,
    ) -> Result<(), RatemeshError> {
        let mut receiver = self.sender.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = receiver.recv() => match received {
                    Ok(batch) => {
                        for event in batch {
                            handler(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "in-memory consumer lagged, events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    } // end method start
}
