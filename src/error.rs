/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum RatemeshError {
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The publish queue is full; the event was dropped.
    #[error("publish queue is full")]
    PublishQueueFull,

    /// The publish queue is closed; the broker is shutting down.
    #[error("publish queue is closed")]
    PublishQueueClosed,

    /// `start` was called on a broker that is already running.
    #[error("broker already started")]
    BrokerAlreadyStarted,

    /// A stream record could not be interpreted as a rate batch.
    #[error("malformed stream record: {0}")]
    MalformedRecord(String),

    /// The external clock reference could not be queried.
    #[error("clock reference error: {0}")]
    ClockReference(String),

    /// Redis error.
    #[cfg(feature = "redis-broker")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON decode error.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
