//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! - **Durable delivery**: entries persist until acknowledged by the group
//! - **Consumer groups**: each consumer kind (summary projection, listeners) has its own group
//! - **Dead-letter handling**: entries redelivered too often go to the DLQ stream
//!
//! ## Layout
//!
//! - **Stream key**: `stockledger:events` (single stream; `partition_key` is stored per entry)
//! - **Dead-letter queue**: `stockledger:events:dlq`
//!
//! Entries are handed to the subscription one at a time and acknowledged only after
//! the consumer settles them as handled. Unsettled entries stay pending and are
//! claimed again once idle; consumers are idempotent per partition key.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{error, instrument, warn};

use stockledger_events::{EventBus, EventEnvelope, Subscription};

const DEFAULT_STREAM_KEY: &str = "stockledger:events";
const DEFAULT_MAX_RETRIES: u32 = 5;
/// Pending entries idle longer than this are claimed for redelivery.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    group_name: String,
    max_retries: u32,
    pending_timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Entry read from the stream with its delivery metadata.
#[derive(Debug, Clone)]
struct StreamMessage {
    message_id: String,
    envelope: EventEnvelope<JsonValue>,
    delivery_count: u32,
}

impl RedisStreamsEventBus {
    /// `stream_key` defaults to `stockledger:events`; the DLQ is `{stream_key}:dlq`.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        group_name: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let stream_key = stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string());

        Ok(Self {
            client: Arc::new(client),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group_name: group_name.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        })
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Create the consumer group (and the stream) if missing.
    pub fn ensure_consumer_group(&self, group_name: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        // BUSYGROUP when it already exists; that is the idempotent case.
        let result: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    #[instrument(
        skip(self, message),
        fields(
            stream_key = %self.stream_key,
            partition_key = %message.partition_key(),
            sequence_number = message.sequence_number()
        ),
        err
    )]
    fn publish_sync(&self, message: EventEnvelope<JsonValue>) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("event_type")
            .arg(message.event_type())
            .arg("partition_key")
            .arg(message.partition_key())
            .arg("sequence_number")
            .arg(message.sequence_number().to_string())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        Ok(())
    }

    fn acknowledge_sync(&self, group_name: &str, message_ids: &[String]) -> Result<(), RedisStreamsError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg(message_ids)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    fn send_to_dlq_sync(&self, message: &StreamMessage) -> Result<(), RedisStreamsError> {
        let payload = serde_json::to_string(&message.envelope)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&message.message_id)
            .arg("delivery_count")
            .arg(message.delivery_count.to_string())
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "message sent to dead-letter queue"
        );
        Ok(())
    }

    /// Stale pending entries first, then new ones (blocking up to `block_ms`).
    fn read_group_sync(
        &self,
        group_name: &str,
        consumer_name: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, RedisStreamsError> {
        let mut conn = self.connection()?;

        let claimed = self.claim_stale_sync(&mut conn, group_name, consumer_name, count)?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        let result: redis::RedisResult<Option<HashMap<String, Vec<redis::Value>>>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group_name)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count.to_string())
            .arg("BLOCK")
            .arg(block_ms.to_string())
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(&mut conn);

        let entries = result
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?
            .and_then(|mut streams| streams.remove(&self.stream_key))
            .unwrap_or_default();

        Ok(entries
            .into_iter()
            .filter_map(|entry| match parse_stream_entry(entry, 1) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable stream entry");
                    None
                }
            })
            .collect())
    }

    fn claim_stale_sync(
        &self,
        conn: &mut redis::Connection,
        group_name: &str,
        consumer_name: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, RedisStreamsError> {
        // XPENDING extended form: [id, consumer, idle_ms, delivery_count]
        let pending: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg("IDLE")
            .arg(self.pending_timeout_ms.to_string())
            .arg("-")
            .arg("+")
            .arg(count.to_string())
            .query(conn);
        let Ok(pending) = pending else {
            return Ok(vec![]);
        };
        if pending.is_empty() {
            return Ok(vec![]);
        }

        let deliveries: HashMap<String, u32> = pending
            .iter()
            .map(|(id, _, _, n)| (id.clone(), *n as u32 + 1))
            .collect();
        let ids: Vec<&String> = pending.iter().map(|(id, ..)| id).collect();

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(group_name)
            .arg(consumer_name)
            .arg(self.pending_timeout_ms.to_string())
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

        Ok(claimed
            .into_iter()
            .filter_map(|entry| parse_stream_entry(entry, 0).ok())
            .map(|mut msg| {
                msg.delivery_count = deliveries.get(&msg.message_id).copied().unwrap_or(1);
                msg
            })
            .collect())
    }

    /// Subscribe through a named consumer of this bus's group.
    ///
    /// A polling thread forwards entries to the returned subscription and
    /// acknowledges each one after the consumer settles it as handled.
    pub fn subscribe_as(&self, consumer_name: &str) -> Subscription<EventEnvelope<JsonValue>> {
        let bus = self.clone();
        let group = self.group_name.clone();
        let consumer = consumer_name.to_string();
        let (tx, rx) = mpsc::channel();
        let (settle_tx, settle_rx) = mpsc::channel::<bool>();

        if let Err(e) = bus.ensure_consumer_group(&group) {
            error!(group = %group, error = %e, "failed to create consumer group");
        }

        let spawned = thread::Builder::new()
            .name(format!("redis-streams-{consumer}"))
            .spawn(move || loop {
                let messages = match bus.read_group_sync(&group, &consumer, 10, 100) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(error = %e, "failed to read from stream");
                        thread::sleep(Duration::from_millis(500));
                        continue;
                    }
                };

                let mut handled = Vec::with_capacity(messages.len());
                for msg in messages {
                    if msg.delivery_count > bus.max_retries {
                        match bus.send_to_dlq_sync(&msg) {
                            Ok(()) => handled.push(msg.message_id),
                            Err(e) => error!(error = %e, "failed to send message to DLQ"),
                        }
                        continue;
                    }
                    if tx.send(msg.envelope).is_err() {
                        return; // receiver dropped
                    }
                    match settle_rx.recv() {
                        Ok(true) => handled.push(msg.message_id),
                        Ok(false) => warn!(
                            message_id = %msg.message_id,
                            delivery_count = msg.delivery_count,
                            "consumer failed; entry left pending for redelivery"
                        ),
                        Err(_) => return, // subscription dropped
                    }
                }

                if let Err(e) = bus.acknowledge_sync(&group, &handled) {
                    error!(error = %e, "failed to acknowledge messages");
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn redis streams poller");
        }

        Subscription::with_settlement(rx, settle_tx)
    }
}

/// Entry format: `[message_id, [field1, value1, field2, value2, ...]]`.
fn parse_stream_entry(entry: redis::Value, delivery_count: u32) -> Result<StreamMessage, RedisStreamsError> {
    let invalid = |what: &str| RedisStreamsError::Deserialization(what.to_string());

    let redis::Value::Bulk(mut parts) = entry else {
        return Err(invalid("invalid entry format"));
    };
    if parts.len() < 2 {
        return Err(invalid("entry too short"));
    }
    let fields = parts.pop();
    let message_id = match parts.pop() {
        Some(redis::Value::Data(data)) => String::from_utf8_lossy(&data).to_string(),
        _ => return Err(invalid("invalid message id")),
    };
    let Some(redis::Value::Bulk(fields)) = fields else {
        return Err(invalid("invalid fields format"));
    };

    let mut payload = None;
    for pair in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
            if key.as_slice() == b"payload" {
                payload = Some(String::from_utf8_lossy(value).to_string());
            }
        }
    }
    let payload = payload.ok_or_else(|| invalid("missing payload field"))?;
    let envelope: EventEnvelope<JsonValue> = serde_json::from_str(&payload)
        .map_err(|e| RedisStreamsError::Deserialization(format!("failed to deserialize envelope: {e}")))?;

    Ok(StreamMessage {
        message_id,
        envelope,
        delivery_count,
    })
}

impl EventBus<EventEnvelope<JsonValue>> for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        self.publish_sync(message)
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.subscribe_as(&format!("consumer-{}", uuid::Uuid::now_v7()))
    }
}
