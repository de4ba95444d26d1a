use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use redis::{
    AsyncCommands,
    aio::ConnectionManager,
    streams::{StreamId, StreamReadOptions, StreamReadReply},
};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    RateBatch, RateEvent, RatemeshError, StreamName,
    broker::{EventHandler, MessageBroker},
};

/// Stream record field holding the serialized batch.
const EVENTS_FIELD: &str = "events";

/// Concurrency bound for handler invocations within one record.
const HANDLER_FANOUT: usize = 16;

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Configuration for a [`RedisStreamBroker`].
#[derive(Debug, Clone)]
pub struct RedisStreamBrokerOptions {
    /// Stream key events are appended to; a good value is the name of your
    /// application.
    pub stream: StreamName,
    /// Caps the stream length via approximate trimming; `None` leaves the
    /// stream unbounded.
    pub max_stream_len: Option<usize>,
    /// Lookback applied to the consumer cursor on startup, so a restarting
    /// instance can reconstruct recent history. Zero reads from the tail.
    pub initial_load_offset: Duration,
    /// Capacity of the bounded publish queue.
    pub publish_queue_capacity: usize,
    /// Most events packed into one stream record.
    pub max_batch_size: usize,
    /// Width of the in-flight publish semaphore.
    pub max_publish_tasks: usize,
    /// Deadline applied to each background publish.
    pub publish_timeout: Duration,
    /// Most records fetched per stream read.
    pub read_count: usize,
}

impl Default for RedisStreamBrokerOptions {
    fn default() -> Self {
        Self {
            stream: StreamName::default(),
            max_stream_len: None,
            initial_load_offset: Duration::ZERO,
            publish_queue_capacity: 100,
            max_batch_size: 100,
            max_publish_tasks: 100,
            publish_timeout: Duration::from_millis(500),
            read_count: 100,
        }
    }
}

/// Exponential retry backoff: min, doubling, capped, no jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempt: 0,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = self
            .min
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Message broker over a Redis stream (`XADD`/`XREAD`).
///
/// Publishes go through a bounded queue: a flush loop packages queued events
/// into batches and appends each batch as one stream record from a background
/// task, bounded by a semaphore permit and a per-publish deadline. The
/// consumer tails the stream and hands every decoded event to the handler.
///
/// The queue being full drops new events at the decision boundary by design:
/// producer backpressure on the caller would turn a local-latency guarantee
/// into a network-dependent one.
pub struct RedisStreamBroker {
    client: redis::Client,
    stream: StreamName,
    max_stream_len: Option<usize>,
    initial_load_offset: Duration,
    read_count: usize,
    max_batch_size: usize,
    max_publish_tasks: usize,
    publish_timeout: Duration,
    publish_tx: mpsc::Sender<RateEvent>,
    publish_rx: Mutex<Option<mpsc::Receiver<RateEvent>>>,
    publish_permits: Arc<Semaphore>,
}

impl RedisStreamBroker {
    pub fn new(client: redis::Client, options: RedisStreamBrokerOptions) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(options.publish_queue_capacity.max(1));

        Self {
            client,
            stream: options.stream,
            max_stream_len: options.max_stream_len,
            initial_load_offset: options.initial_load_offset,
            read_count: options.read_count,
            max_batch_size: options.max_batch_size.max(1),
            max_publish_tasks: options.max_publish_tasks.max(1),
            publish_timeout: options.publish_timeout,
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            publish_permits: Arc::new(Semaphore::new(options.max_publish_tasks.max(1))),
        }
    } // end constructor

    async fn run_publisher(
        &self,
        rx: mpsc::Receiver<RateEvent>,
        connection: ConnectionManager,
        cancel: CancellationToken,
    ) -> Result<(), RatemeshError> {
        self.publish_loop(rx, connection, &cancel).await;

        // Give in-flight publishes a bounded grace period; each one is
        // already capped by its own deadline.
        let _ = tokio::time::timeout(
            self.publish_timeout,
            Arc::clone(&self.publish_permits).acquire_many_owned(self.max_publish_tasks as u32),
        )
        .await;

        Ok(())
    } // end method run_publisher

    async fn publish_loop(
        &self,
        mut rx: mpsc::Receiver<RateEvent>,
        connection: ConnectionManager,
        cancel: &CancellationToken,
    ) {
        loop {
            // Block for the first event so a lone event is never delayed;
            // the rest of the batch is whatever is already waiting.
            let first = tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            let mut events = Vec::with_capacity(self.max_batch_size);
            events.push(first);

            while events.len() < self.max_batch_size
                && let Ok(event) = rx.try_recv()
            {
                events.push(event);
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = Arc::clone(&self.publish_permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let mut connection = connection.clone();
            let stream = self.stream.clone();
            let max_stream_len = self.max_stream_len;
            let deadline = self.publish_timeout;

            tokio::spawn(async move {
                let _permit = permit;
                let batch = RateBatch::from(events);

                let append = append_batch(&mut connection, &stream, max_stream_len, &batch);
                match tokio::time::timeout(deadline, append).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, stream = %stream, "error publishing rate batch");
                    }
                    Err(_) => {
                        tracing::error!(stream = %stream, "publishing rate batch timed out");
                    }
                }
            });
        }
    } // end method publish_loop

    async fn run_consumer(
        &self,
        mut connection: ConnectionManager,
        cancel: CancellationToken,
        handler: EventHandler,
    ) -> Result<(), RatemeshError> {
        let mut cursor = self.initial_cursor();
        let mut backoff = Backoff::new(BACKOFF_MIN, BACKOFF_MAX);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let reply: StreamReadReply = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.read_records(&mut connection, &cursor) => match result {
                    Ok(reply) => {
                        backoff.reset();
                        reply
                    }
                    Err(err) => {
                        tracing::error!(error = %err, stream = %self.stream, "error reading rate events from stream");
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(backoff.next()) => {}
                        }
                        continue;
                    }
                },
            };

            for stream_key in reply.keys {
                for record in stream_key.ids {
                    match decode_events(&record) {
                        Ok(events) => {
                            futures::stream::iter(events)
                                .for_each_concurrent(HANDLER_FANOUT, |event| {
                                    let handler = Arc::clone(&handler);
                                    async move { handler(event) }
                                })
                                .await;
                        }
                        Err(err) => {
                            // The record is unusable; skip it and move on so
                            // one bad producer cannot wedge the consumer.
                            tracing::warn!(error = %err, id = %record.id, "skipping malformed stream record");
                        }
                    }

                    cursor = record.id.clone();
                }
            }
        }
    } // end method run_consumer

    async fn read_records(
        &self,
        connection: &mut ConnectionManager,
        cursor: &str,
    ) -> Result<StreamReadReply, RatemeshError> {
        let options = StreamReadOptions::default().count(self.read_count).block(0);

        let reply = connection
            .xread_options(&[self.stream.as_str()], &[cursor], &options)
            .await?;

        Ok(reply)
    }

    fn initial_cursor(&self) -> String {
        if self.initial_load_offset.is_zero() {
            return "$".to_string();
        }

        let offset = TimeDelta::from_std(self.initial_load_offset).unwrap_or(TimeDelta::MAX);
        let start = Utc::now() - offset;

        // Stream ids are millisecond-epoch prefixed, so this replays every
        // record appended since the lookback point.
        format!("{}-0", start.timestamp_millis().max(0))
    }
}

#[async_trait::async_trait]
impl MessageBroker for RedisStreamBroker {
    fn publish(&self, event: RateEvent) -> Result<(), RatemeshError> {
        self.publish_tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RatemeshError::PublishQueueFull,
            mpsc::error::TrySendError::Closed(_) => RatemeshError::PublishQueueClosed,
        })
    }

    async fn start(
        &self,
        cancel: CancellationToken,
        handler: EventHandler,
    ) -> Result<(), RatemeshError> {
        let rx = self
            .publish_rx
            .lock()
            .take()
            .ok_or(RatemeshError::BrokerAlreadyStarted)?;

        // Separate connections: a blocking stream read parks its connection,
        // and publishes must not queue behind it.
        let publisher_connection = self.client.get_connection_manager().await?;
        let consumer_connection = self.client.get_connection_manager().await?;

        tokio::try_join!(
            self.run_publisher(rx, publisher_connection, cancel.clone()),
            self.run_consumer(consumer_connection, cancel, handler),
        )?;

        Ok(())
    } // end method start
}

async fn append_batch(
    connection: &mut ConnectionManager,
    stream: &StreamName,
    max_stream_len: Option<usize>,
    batch: &RateBatch,
) -> Result<(), RatemeshError> {
    let payload = serde_json::to_string(batch)?;

    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream.as_str());
    if let Some(max_len) = max_stream_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg("*").arg(EVENTS_FIELD).arg(payload);

    let _: String = cmd.query_async(connection).await?;

    Ok(())
}

fn decode_events(record: &StreamId) -> Result<Vec<RateEvent>, RatemeshError> {
    let value = record.map.get(EVENTS_FIELD).ok_or_else(|| {
        RatemeshError::MalformedRecord(format!("record {} has no '{EVENTS_FIELD}' field", record.id))
    })?;

    let payload: String = redis::from_redis_value(value)?;
    let batch: RateBatch = serde_json::from_str(&payload)?;

    Ok(batch.into_events())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::EventKind;

    fn test_broker(initial_load_offset: Duration) -> RedisStreamBroker {
        // The client connects lazily; building a broker never touches the
        // network.
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        RedisStreamBroker::new(
            client,
            RedisStreamBrokerOptions {
                initial_load_offset,
                ..RedisStreamBrokerOptions::default()
            },
        )
    }

    fn record(id: &str, payload: Option<&str>) -> StreamId {
        let mut map = std::collections::HashMap::new();
        if let Some(payload) = payload {
            map.insert(
                EVENTS_FIELD.to_string(),
                redis::Value::BulkString(payload.as_bytes().to_vec()),
            );
        }
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(BACKOFF_MIN, BACKOFF_MAX);

        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(400));
        assert_eq!(backoff.next(), Duration::from_millis(800));

        for _ in 0..20 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(10));
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::new(BACKOFF_MIN, BACKOFF_MAX);

        backoff.next();
        backoff.next();
        backoff.reset();

        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[test]
    fn tail_cursor_without_replay_offset() {
        let broker = test_broker(Duration::ZERO);
        assert_eq!(broker.initial_cursor(), "$");
    }

    #[test]
    fn replay_cursor_points_one_offset_back() {
        let broker = test_broker(Duration::from_secs(60));
        let cursor = broker.initial_cursor();

        let millis: i64 = cursor
            .strip_suffix("-0")
            .expect("cursor should be a millisecond stream id")
            .parse()
            .unwrap();

        let expected = Utc::now().timestamp_millis() - 60_000;
        assert!((millis - expected).abs() < 1_000, "cursor = {cursor}");
    }

    #[test]
    fn decodes_the_events_field() {
        let payload = r#"[{
            "broker_id": "b",
            "event": "REQUEST_ACCEPTED",
            "timestamp": "2024-06-01T12:00:00.5Z",
            "key": "user1"
        }]"#;

        let events = decode_events(&record("1-0", Some(payload))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::RequestAccepted);
        assert_eq!(events[0].key, "user1");
    }

    #[test]
    fn missing_events_field_is_malformed() {
        let err = decode_events(&record("1-0", None)).unwrap_err();
        assert!(matches!(err, RatemeshError::MalformedRecord(_)));
    }

    #[test]
    fn invalid_json_is_a_decode_error() {
        let err = decode_events(&record("1-0", Some("not json"))).unwrap_err();
        assert!(matches!(err, RatemeshError::Decode(_)));
    }

    #[test]
    fn full_queue_surfaces_an_error() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let broker = RedisStreamBroker::new(
            client,
            RedisStreamBrokerOptions {
                publish_queue_capacity: 2,
                ..RedisStreamBrokerOptions::default()
            },
        );

        // Nothing drains the queue until start is called.
        for _ in 0..2 {
            broker
                .publish(RateEvent::accepted("b", Utc::now(), "k"))
                .unwrap();
        }

        let err = broker
            .publish(RateEvent::accepted("b", Utc::now(), "k"))
            .unwrap_err();
        assert!(matches!(err, RatemeshError::PublishQueueFull));
    }
}
