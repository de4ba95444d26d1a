use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of an event carried on the stream.
///
/// Decoding tolerates kinds this version does not know about; they fold into
/// [`EventKind::Unknown`] and are ignored by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A request was accepted by the originating instance.
    #[serde(rename = "REQUEST_ACCEPTED")]
    RequestAccepted,
    /// An event kind from a newer peer; carried but never acted on.
    #[serde(other)]
    Unknown,
}

/// A single rate event as exchanged between instances.
///
/// Immutable once created: either built at the instant of a local acceptance
/// or decoded from the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEvent {
    /// Opaque id of the originating process instance.
    pub broker_id: String,
    /// What happened.
    pub event: EventKind,
    /// When it happened, as observed by the originator's clock.
    pub timestamp: DateTime<Utc>,
    /// The limiter key the event applies to.
    pub key: String,
}

impl RateEvent {
    /// Build a `REQUEST_ACCEPTED` event for `key` observed at `timestamp`.
    pub fn accepted(broker_id: impl Into<String>, timestamp: DateTime<Utc>, key: impl Into<String>) -> Self {
        Self {
            broker_id: broker_id.into(),
            event: EventKind::RequestAccepted,
            timestamp,
            key: key.into(),
        }
    }
}

/// An ordered sequence of [`RateEvent`]s; the on-wire unit.
///
/// Serializes as a bare JSON array so the stream record's `events` field holds
/// `[{...}, {...}]`, not a wrapping object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateBatch {
    events: Vec<RateEvent>,
}

impl RateBatch {
    pub fn new(events: Vec<RateEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[RateEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<RateEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<Vec<RateEvent>> for RateBatch {
    fn from(events: Vec<RateEvent>) -> Self {
        Self { events }
    }
}

impl IntoIterator for RateBatch {
    type Item = RateEvent;
    type IntoIter = std::vec::IntoIter<RateEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
