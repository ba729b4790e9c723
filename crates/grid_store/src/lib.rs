//! Redis access layer shared by the pixel-grid services.
//!
//! One store backs the whole pipeline: the event stream (a Redis Stream
//! consumed through a consumer group), the packed-nibble snapshot
//! (BITFIELD), the per-epoch updates windows (sorted sets), the dedup keys
//! (SET NX EX) and the broadcast bus (pub/sub).

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use tracing::info;

/// Stream field under which the raw 8-byte cell event is stored.
pub const VALUES_FIELD: &str = "values";

const LATEST_EPOCH_SUFFIX: &str = "latest_epoch";
const PROCESSED_SUFFIX: &str = "processed";

/// One entry read from the event stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Server-assigned stream ID, `<millis>-<seq>`.
    pub id: String,
    /// Raw `values` field, if the message carried one.
    pub values: Option<Vec<u8>>,
}

/// Key of the latest-epoch marker.
pub fn latest_epoch_key(grid_key: &str) -> String {
    format!("{grid_key}:{LATEST_EPOCH_SUFFIX}")
}

/// Key marking one stream message as applied.
pub fn processed_key(grid_key: &str, id: &str) -> String {
    format!("{grid_key}:{PROCESSED_SUFFIX}:{id}")
}

/// Async Redis client for grid state, stream and bus operations.
#[derive(Clone)]
pub struct GridStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl GridStore {
    /// Connect and build the managed connection used by all data commands.
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Connected to Redis at {}", url);
        Ok(Self { client, conn })
    }

    /// Append one encoded cell event to the stream.
    pub async fn append_event(&self, stream: &str, payload: &[u8]) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.xadd(stream, "*", &[(VALUES_FIELD, payload)]).await?;
        Ok(())
    }

    /// Create the consumer group, tolerating one that already exists.
    pub async fn create_group(&self, stream: &str, group: &str) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let created: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {
                info!("Created consumer group '{}' on '{}'", group, stream);
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Block-read up to `count` undelivered messages for this consumer.
    ///
    /// An empty result after the block time is not an error.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> RedisResult<Vec<StreamEvent>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;

        let mut events = Vec::new();
        for stream_reply in reply.keys {
            for msg in stream_reply.ids {
                let values = msg
                    .map
                    .get(VALUES_FIELD)
                    .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok());
                events.push(StreamEvent { id: msg.id, values });
            }
        }
        Ok(events)
    }

    /// Acknowledge one message to the group.
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Write one 4-bit color into the packed snapshot at a bit offset.
    pub async fn write_cell(&self, grid_key: &str, bit_offset: u64, color: u8) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: redis::Value = redis::cmd("BITFIELD")
            .arg(grid_key)
            .arg("SET")
            .arg("u4")
            .arg(bit_offset)
            .arg(color)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Read the whole packed snapshot; `None` when no cell was ever drawn.
    pub async fn read_snapshot(&self, grid_key: &str) -> RedisResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let snapshot: Option<Vec<u8>> = conn.get(grid_key).await?;
        Ok(snapshot)
    }

    /// Add one raw event to an epoch window, scored by its millis.
    pub async fn add_window_entry(
        &self,
        window_key: &str,
        score_ms: i64,
        payload: &[u8],
    ) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(window_key, payload, score_ms).await?;
        Ok(())
    }

    /// All raw events of an epoch window in ascending score order.
    pub async fn window_entries(&self, window_key: &str) -> RedisResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let entries: Vec<Vec<u8>> = conn.zrangebyscore(window_key, "-inf", "+inf").await?;
        Ok(entries)
    }

    /// Move the latest-epoch marker.
    pub async fn set_latest_epoch(&self, grid_key: &str, epoch: i64) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(latest_epoch_key(grid_key), epoch).await?;
        Ok(())
    }

    /// Read the latest-epoch marker.
    pub async fn latest_epoch(&self, grid_key: &str) -> RedisResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let epoch: Option<i64> = conn.get(latest_epoch_key(grid_key)).await?;
        Ok(epoch)
    }

    /// Whether a stream message was already applied.
    pub async fn is_processed(&self, grid_key: &str, id: &str) -> RedisResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(processed_key(grid_key, id)).await?;
        Ok(exists)
    }

    /// Mark a stream message as applied, with a redelivery-horizon TTL.
    pub async fn mark_processed(
        &self,
        grid_key: &str,
        id: &str,
        ttl: Duration,
    ) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: Option<String> = redis::cmd("SET")
            .arg(processed_key(grid_key, id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Publish one raw event on the broadcast bus.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection subscribed to the bus channel.
    pub async fn subscribe(&self, channel: &str) -> RedisResult<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(latest_epoch_key("grid"), "grid:latest_epoch");
        assert_eq!(
            processed_key("grid", "1704067200123-0"),
            "grid:processed:1704067200123-0"
        );
    }
}
