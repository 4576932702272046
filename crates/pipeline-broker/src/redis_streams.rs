//! Redis Streams binding.
//!
//! A queue is a stream and every consumer reads it through one consumer group,
//! so each entry goes to one consumer and stays in the group's pending list
//! until it is acknowledged with `XACK`. On start a consumer first replays its
//! own pending entries, which covers deliveries it received but never settled
//! before a crash.
//!
//! There are no exchanges or bindings: only the default exchange is
//! routable, and it routes a routing key to the declared queue of that name.

use crate::{
    Acknowledger, Broker, BrokerError, BrokerResult, ConsumeOptions, Delivery, DeliveryStream,
    Publishing, QueueOptions,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const FIELD_BODY: &str = "body";
const FIELD_CONTENT_TYPE: &str = "content_type";
const FIELD_ROUTING_KEY: &str = "routing_key";
const FIELD_EXCHANGE: &str = "exchange";
const DEAD_LETTER_SUFFIX: &str = ":dead-letter";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CONSUMER_BUFFER: usize = 64;

/// Connection settings for [`RedisStreamsBroker`].
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub redis_url: String,
    /// Consumer group shared by every consumer of a queue.
    pub consumer_group: String,
    /// How long one `XREADGROUP` waits for new entries.
    pub block_timeout_ms: u64,
    /// Entries fetched per read.
    pub read_count: usize,
}

/// [`Broker`] backed by Redis Streams.
pub struct RedisStreamsBroker {
    client: Client,
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
}

impl RedisStreamsBroker {
    /// Connect to Redis.
    pub async fn connect(config: RedisBrokerConfig) -> BrokerResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %config.redis_url, group = %config.consumer_group, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            config,
        })
    }

    /// Stream a publish lands on.
    ///
    /// Named exchanges have no bindings here, so publishing through one is
    /// unroutable rather than written to a stream nobody reads.
    pub fn stream_for<'a>(exchange: &str, routing_key: &'a str) -> BrokerResult<&'a str> {
        if exchange.is_empty() {
            Ok(routing_key)
        } else {
            Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            })
        }
    }

    async fn ensure_consumer_group(&self, stream_key: &str) -> BrokerResult<()> {
        ensure_consumer_group(&mut self.conn.clone(), stream_key, &self.config.consumer_group).await
    }
}

async fn ensure_consumer_group(
    conn: &mut MultiplexedConnection,
    stream_key: &str,
    group: &str,
) -> BrokerResult<()> {
    // $ skips history: a new group only sees entries added after it exists.
    let result: RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream_key)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match result {
        Ok(()) => {
            info!(stream = %stream_key, group = %group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            debug!(stream = %stream_key, group = %group, "Consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn declare_queue(&self, options: &QueueOptions) -> BrokerResult<()> {
        if options.exclusive || options.auto_delete {
            debug!(
                queue = %options.name,
                "Redis streams ignore exclusive and auto-delete flags"
            );
        }
        self.ensure_consumer_group(&options.name).await
    }

    async fn publish(&self, publishing: &Publishing) -> BrokerResult<()> {
        let stream_key = Self::stream_for(&publishing.exchange, &publishing.routing_key)?;
        // NOMKSTREAM: a queue that was never declared yields nil, not a new stream.
        let entry_id: Option<String> = redis::cmd("XADD")
            .arg(stream_key)
            .arg("NOMKSTREAM")
            .arg("*")
            .arg(FIELD_CONTENT_TYPE)
            .arg(&publishing.content_type)
            .arg(FIELD_ROUTING_KEY)
            .arg(&publishing.routing_key)
            .arg(FIELD_EXCHANGE)
            .arg(&publishing.exchange)
            .arg(FIELD_BODY)
            .arg(publishing.body.as_slice())
            .query_async(&mut self.conn.clone())
            .await?;
        let Some(entry_id) = entry_id else {
            return Err(BrokerError::Unroutable {
                exchange: publishing.exchange.clone(),
                routing_key: publishing.routing_key.clone(),
            });
        };
        debug!(stream = %stream_key, entry_id = %entry_id, "Published entry");
        Ok(())
    }

    async fn consume(&self, options: &ConsumeOptions) -> BrokerResult<DeliveryStream> {
        let stream_key = options.queue.clone();
        self.ensure_consumer_group(&stream_key).await?;

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let pending = (!options.auto_ack).then(|| {
            Arc::new(RedisAcker {
                conn: self.conn.clone(),
                stream_key: stream_key.clone(),
                group: self.config.consumer_group.clone(),
                pending: Mutex::new(HashMap::new()),
            })
        });
        let acker: Arc<dyn Acknowledger> = match &pending {
            Some(acker) => Arc::clone(acker) as Arc<dyn Acknowledger>,
            None => Arc::new(NoopAcker),
        };
        let reader = StreamReader {
            client: self.client.clone(),
            conn: self.conn.clone(),
            stream_key,
            group: self.config.consumer_group.clone(),
            consumer: options.consumer_tag.clone(),
            block_timeout_ms: self.config.block_timeout_ms,
            read_count: self.config.read_count.max(1),
            auto_ack: options.auto_ack,
            next_tag: AtomicU64::new(1),
            pending,
            acker,
            tx,
        };
        tokio::spawn(reader.run());

        info!(queue = %options.queue, consumer = %options.consumer_tag, "Consumer started");
        Ok(DeliveryStream::new(rx))
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    fn field_string(&self, name: &str) -> String {
        self.fields
            .get(name)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .unwrap_or_default()
    }
}

struct StreamReader {
    client: Client,
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    consumer: String,
    block_timeout_ms: u64,
    read_count: usize,
    auto_ack: bool,
    next_tag: AtomicU64,
    /// Present unless the consumer runs with `NOACK`.
    pending: Option<Arc<RedisAcker>>,
    acker: Arc<dyn Acknowledger>,
    tx: mpsc::Sender<Delivery>,
}

impl StreamReader {
    async fn run(mut self) {
        // Pending replay walks this consumer's unacked entries from the start.
        let mut replay_cursor = Some("0".to_string());

        while !self.tx.is_closed() {
            let start = replay_cursor.clone().unwrap_or_else(|| ">".to_string());
            let entries = match self.read(&start).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(stream = %self.stream_key, error = %e, "Stream read failed, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    self.reconnect().await;
                    continue;
                }
            };

            if replay_cursor.is_some() {
                match entries.last() {
                    Some(last) => replay_cursor = Some(last.id.clone()),
                    None => {
                        debug!(stream = %self.stream_key, "Pending replay complete");
                        replay_cursor = None;
                        continue;
                    }
                }
            }

            let redelivered = replay_cursor.is_some();
            for entry in entries {
                if self.deliver(entry, redelivered).await.is_err() {
                    debug!(stream = %self.stream_key, "Delivery stream closed");
                    return;
                }
            }
        }
    }

    async fn read(&mut self, start: &str) -> BrokerResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.read_count)
            .arg("BLOCK")
            .arg(self.block_timeout_ms);
        if self.auto_ack {
            cmd.arg("NOACK");
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(start);

        let value: Value = cmd.query_async(&mut self.conn).await?;
        parse_stream_entries(value)
    }

    async fn deliver(&mut self, entry: StreamEntry, redelivered: bool) -> Result<(), ()> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery::new(
            tag,
            entry.field_string(FIELD_EXCHANGE),
            entry.field_string(FIELD_ROUTING_KEY),
            entry.field_string(FIELD_CONTENT_TYPE),
            entry.fields.get(FIELD_BODY).cloned().unwrap_or_default(),
            redelivered,
            Arc::clone(&self.acker),
        );
        if let Some(pending) = &self.pending {
            pending.pending.lock().insert(tag, entry);
        }
        self.tx.send(delivery).await.map_err(|_| ())
    }

    async fn reconnect(&mut self) {
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                self.conn = conn;
                if let Err(e) =
                    ensure_consumer_group(&mut self.conn, &self.stream_key, &self.group).await
                {
                    warn!(stream = %self.stream_key, error = %e, "Failed to restore consumer group");
                }
            }
            Err(e) => warn!(error = %e, "Redis reconnect failed"),
        }
    }
}

/// Settles deliveries with `XACK`, re-adding or dead-lettering on nack.
struct RedisAcker {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    pending: Mutex<HashMap<u64, StreamEntry>>,
}

impl RedisAcker {
    fn take(&self, delivery_tag: u64) -> BrokerResult<StreamEntry> {
        self.pending
            .lock()
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown delivery tag {delivery_tag}")))
    }
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let entry = self.take(delivery_tag)?;
        let acked: i64 = self
            .conn
            .clone()
            .xack(&self.stream_key, &self.group, &[&entry.id])
            .await?;
        if acked != 1 {
            warn!(entry_id = %entry.id, stream = %self.stream_key, acked, "XACK did not remove entry");
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let entry = self.take(delivery_tag)?;
        let target = if requeue {
            self.stream_key.clone()
        } else {
            format!("{}{}", self.stream_key, DEAD_LETTER_SUFFIX)
        };

        let mut add = redis::cmd("XADD");
        add.arg(&target).arg("*");
        let mut names: Vec<&String> = entry.fields.keys().collect();
        names.sort();
        for name in names {
            add.arg(name).arg(entry.fields[name].as_slice());
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .add_command(add)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&entry.id)
            .ignore();
        let (): () = pipe.query_async(&mut self.conn.clone()).await?;

        debug!(entry_id = %entry.id, target = %target, requeue, "Rejected entry");
        Ok(())
    }
}

/// Acknowledger for `NOACK` consumers; the broker settled the entry already.
struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self, _delivery_tag: u64) -> BrokerResult<()> {
        Ok(())
    }

    async fn nack(&self, _delivery_tag: u64, _requeue: bool) -> BrokerResult<()> {
        Ok(())
    }
}

/// Parse an `XREADGROUP` reply into entries.
///
/// Reply shape: `[[stream_key, [[entry_id, [field, value, ...]], ...]], ...]`, or
/// nil when the block timeout expires. Entries whose payload was trimmed away
/// come back with a nil field list and are skipped.
fn parse_stream_entries(value: Value) -> BrokerResult<Vec<StreamEntry>> {
    let streams: Vec<(Value, Value)> = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Map(pairs) => pairs,
        Value::Array(streams) => streams
            .into_iter()
            .map(|stream| match stream {
                Value::Array(mut parts) if parts.len() == 2 => {
                    let entries = parts.pop().unwrap_or(Value::Nil);
                    let key = parts.pop().unwrap_or(Value::Nil);
                    Ok((key, entries))
                }
                other => Err(BrokerError::Protocol(format!(
                    "Unexpected stream element: {other:?}"
                ))),
            })
            .collect::<BrokerResult<_>>()?,
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XREADGROUP response type: {other:?}"
            )))
        }
    };

    let mut parsed = Vec::new();
    for (_, entries) in streams {
        let entries = match entries {
            Value::Array(entries) => entries,
            Value::Nil => continue,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "Expected array of entries, got {other:?}"
                )))
            }
        };
        for entry in entries {
            let Value::Array(mut parts) = entry else {
                return Err(BrokerError::Protocol("Expected array for entry".to_string()));
            };
            if parts.len() != 2 {
                return Err(BrokerError::Protocol("Entry too short".to_string()));
            }
            let fields = parts.pop().unwrap_or(Value::Nil);
            let id = value_to_string(parts.pop().unwrap_or(Value::Nil))
                .ok_or_else(|| BrokerError::Protocol("Entry id is not a string".to_string()))?;

            let fields = match fields {
                Value::Array(items) => pairs_from_flat(items),
                Value::Map(pairs) => pairs,
                Value::Nil => {
                    warn!(entry_id = %id, "Skipping pending entry with no fields");
                    continue;
                }
                other => {
                    return Err(BrokerError::Protocol(format!(
                        "Expected field list, got {other:?}"
                    )))
                }
            };

            let mut map = HashMap::new();
            for (name, value) in fields {
                if let (Some(name), Some(value)) = (value_to_string(name), value_to_bytes(value)) {
                    map.insert(name, value);
                }
            }
            parsed.push(StreamEntry { id, fields: map });
        }
    }
    Ok(parsed)
}

fn pairs_from_flat(items: Vec<Value>) -> Vec<(Value, Value)> {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((name, value));
    }
    pairs
}

fn value_to_bytes(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes),
        Value::SimpleString(s) => Some(s.into_bytes()),
        _ => None,
    }
}

fn value_to_string(value: Value) -> Option<String> {
    value_to_bytes(value).map(|bytes| String::from_utf8_lossy(&bytes).to_string())
}
