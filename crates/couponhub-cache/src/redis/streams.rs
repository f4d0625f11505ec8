//! Message bus on Redis Streams consumer groups.
//!
//! Each topic is a stream. Publishing is `XADD`; every group is created
//! at id `0` with `MKSTREAM`, consumers read with `XREADGROUP` and
//! acknowledge with `XACK`. A nacked entry stays in the consumer's
//! pending list and is re-read from id `0` before any new entry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tracing::{debug, info};

use couponhub_core::error::{AppError, ErrorKind};
use couponhub_core::result::AppResult;
use couponhub_core::traits::bus::{BusMessage, BusSubscription, Delivery, MessageBus};

use super::client::RedisClient;

/// Message bus backed by Redis Streams.
#[derive(Debug, Clone)]
pub struct RedisStreamBus {
    client: RedisClient,
}

impl RedisStreamBus {
    /// Create a bus on top of a connected client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

fn map_err(e: redis::RedisError) -> AppError {
    AppError::with_source(ErrorKind::MessageBus, format!("Redis stream error: {e}"), e)
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> AppResult<()> {
        let stream = self.client.prefixed_key(topic);
        let payload = serde_json::to_string(&message.payload)?;
        let mut conn = self.client.conn_mut();

        let id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("key")
            .arg(&message.key)
            .arg("event_type")
            .arg(&message.event_type)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        debug!(stream = %stream, id = %id, key = %message.key, "Appended stream entry");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> AppResult<Box<dyn BusSubscription>> {
        let stream = self.client.prefixed_key(topic);
        let mut conn = self.client.dedicated_connection().await?;

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => info!(stream = %stream, group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(map_err(e)),
        }

        Ok(Box::new(RedisStreamSubscription {
            conn,
            stream,
            group: group.to_string(),
            consumer: consumer.to_string(),
            delivery_counts: HashMap::new(),
            // Entries left pending by a previous incarnation of this consumer
            // are read back first.
            replay_pending: true,
        }))
    }
}

/// One consumer's handle on a stream consumer group.
pub struct RedisStreamSubscription {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    delivery_counts: HashMap<String, u32>,
    replay_pending: bool,
}

impl std::fmt::Debug for RedisStreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamSubscription")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl RedisStreamSubscription {
    async fn read(&mut self, start: &str, block: Option<Duration>) -> AppResult<Option<StreamId>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(start);

        let reply: Option<StreamReadReply> =
            cmd.query_async(&mut self.conn).await.map_err(map_err)?;

        Ok(reply.and_then(|r| r.keys.into_iter().next()).and_then(|k| k.ids.into_iter().next()))
    }

    fn to_delivery(&mut self, entry: StreamId) -> AppResult<Delivery> {
        let field = |name: &str| {
            entry.get::<String>(name).ok_or_else(|| {
                AppError::message_bus(format!("Stream entry {} has no '{name}' field", entry.id))
            })
        };
        let message = BusMessage {
            key: field("key")?,
            event_type: field("event_type")?,
            payload: serde_json::from_str(&field("payload")?)?,
        };

        let count = self.delivery_counts.entry(entry.id.clone()).or_insert(0);
        *count += 1;
        Ok(Delivery {
            id: entry.id,
            message,
            delivery_count: *count,
        })
    }
}

#[async_trait]
impl BusSubscription for RedisStreamSubscription {
    async fn next(&mut self, wait: Duration) -> AppResult<Option<Delivery>> {
        if self.replay_pending {
            match self.read("0", None).await? {
                Some(entry) => return self.to_delivery(entry).map(Some),
                None => self.replay_pending = false,
            }
        }
        match self.read(">", Some(wait)).await? {
            Some(entry) => self.to_delivery(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> AppResult<()> {
        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&delivery.id)
            .query_async::<i64>(&mut self.conn)
            .await
            .map_err(map_err)?;
        self.delivery_counts.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> AppResult<()> {
        debug!(stream = %self.stream, id = %delivery.id, "Entry left pending for redelivery");
        self.replay_pending = true;
        Ok(())
    }
}
