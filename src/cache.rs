//! cache.rs
//! Redis-backed cache/bus client (C2): stream append + trim, feature/status
//! hash cache, Pub/Sub publish/subscribe, connection-set and alert-queue
//! maintenance. Every method is best-effort from the ingest path's point of
//! view: failures surface as `PipelineError::CacheUnavailable` and never
//! gate C1/C4.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::model::Sample;

const STREAM_TTL_SECS: i64 = 24 * 60 * 60;
const STREAM_TRIM_LEN: i64 = 25_600;
const FEATURES_TTL_SECS: i64 = 5 * 60;
const STATUS_TTL_SECS: i64 = 60;

pub struct CacheClient {
    conn: ConnectionManager,
    redis_url: String,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient").finish()
    }
}

pub fn stream_key(sensor_id: i64) -> String {
    format!("stream:sensor:{sensor_id}")
}

pub fn features_key(sensor_id: i64) -> String {
    format!("features:sensor:{sensor_id}:latest")
}

pub fn status_key(sensor_id: i64) -> String {
    format!("status:sensor:{sensor_id}")
}

pub const CONNECTIONS_KEY: &str = "connections:active";
pub const ALERTS_QUEUE_KEY: &str = "alerts:queue";

pub fn feature_channel(sensor_id: i64) -> String {
    format!("sensor:{sensor_id}:features")
}

pub fn data_channel(sensor_id: i64) -> String {
    format!("sensor:{sensor_id}:data")
}

pub const ALERTS_CHANNEL: &str = "alerts:all";
pub const BROADCAST_CHANNEL: &str = "broadcast:all";

impl CacheClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(CacheClient {
            conn,
            redis_url: redis_url.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Bulk stream append. One network round-trip via a pipeline, not a
    /// per-sample loop — the original per-sample version is the defect this
    /// replaces.
    pub async fn stream_append_batch(&self, sensor_id: i64, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let key = stream_key(sensor_id);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for sample in samples {
            pipe.cmd("XADD")
                .arg(&key)
                .arg("*")
                .arg("timestamp")
                .arg(sample.timestamp.to_rfc3339())
                .arg("h_acc")
                .arg(sample.h_acc.to_string())
                .arg("v_acc")
                .arg(sample.v_acc.to_string())
                .ignore();
        }
        pipe.cmd("XTRIM")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_TRIM_LEN)
            .ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(STREAM_TTL_SECS).ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn cache_features<T: Serialize>(&self, sensor_id: i64, record: &T) -> Result<()> {
        let json = serde_json::to_value(record)?;
        let fields = flatten_to_strings(&json);
        let key = features_key(sensor_id);
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(&key, &fields).await?;
        let _: () = conn.expire(&key, FEATURES_TTL_SECS).await?;
        Ok(())
    }

    pub async fn get_cached_features(&self, sensor_id: i64) -> Result<Option<HashMap<String, String>>> {
        let key = features_key(sensor_id);
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(&key).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    pub async fn update_sensor_status(&self, sensor_id: i64, streaming: bool, connections: usize) -> Result<()> {
        let key = status_key(sensor_id);
        let mut conn = self.conn.clone();
        let fields = vec![
            ("streaming".to_string(), streaming.to_string()),
            ("connections".to_string(), connections.to_string()),
        ];
        let _: () = conn.hset_multiple(&key, &fields).await?;
        let _: () = conn.expire(&key, STATUS_TTL_SECS).await?;
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)?;
        let _: () = conn.publish(channel, body).await?;
        Ok(())
    }

    pub async fn add_active_connection(&self, connection_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(CONNECTIONS_KEY, connection_id).await?;
        Ok(())
    }

    pub async fn remove_active_connection(&self, connection_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(CONNECTIONS_KEY, connection_id).await?;
        Ok(())
    }

    pub async fn active_connection_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let n: usize = conn.scard(CONNECTIONS_KEY).await?;
        Ok(n)
    }

    pub async fn push_alert(&self, alert: &Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(alert)?;
        let _: () = conn.lpush(ALERTS_QUEUE_KEY, body).await?;
        Ok(())
    }

    pub async fn pop_alert(&self) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.rpop(ALERTS_QUEUE_KEY, None).await?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_pattern(&self, pattern: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }

    /// Opens a dedicated subscription connection (pub/sub needs its own
    /// connection, separate from the pooled `ConnectionManager`) and
    /// returns a finite stream of decoded JSON messages. Decode failures
    /// are logged and skipped rather than ending the stream.
    pub async fn subscribe(&self, channels: Vec<String>) -> Result<MessageStream> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        for ch in &channels {
            pubsub.subscribe(ch).await?;
        }
        Ok(MessageStream { pubsub })
    }
}

fn flatten_to_strings(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Value::Object(map) = value {
        for (k, v) in map {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            out.push((k.clone(), s));
        }
    }
    out
}

pub struct MessageStream {
    pubsub: redis::aio::PubSub,
}

impl MessageStream {
    async fn next_message(&mut self) -> Option<(String, Value)> {
        let mut stream = self.pubsub.on_message();
        let msg = stream.next().await?;
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().ok()?;
        match serde_json::from_str::<Value>(&payload) {
            Ok(v) => Some((channel, v)),
            Err(e) => {
                log::warn!("discarding undecodable pubsub message on {channel}: {e}");
                None
            }
        }
    }

    async fn subscribe_channel(&mut self, channel: &str) -> Result<()> {
        self.pubsub.subscribe(channel).await?;
        Ok(())
    }
}

/// The subset of C2 that the fan-out hub (C6) needs, abstracted so tests
/// can exercise hub broadcast/bridge logic against an in-memory fake
/// instead of a live Redis connection.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()>;
    async fn add_active_connection(&self, connection_id: &str) -> Result<()>;
    async fn remove_active_connection(&self, connection_id: &str) -> Result<()>;
    async fn update_sensor_status(&self, sensor_id: i64, streaming: bool, connections: usize) -> Result<()>;
    async fn subscribe(&self, channels: Vec<String>) -> Result<Box<dyn BridgeStream>>;
}

#[async_trait]
pub trait BridgeStream: Send {
    async fn next(&mut self) -> Option<(String, Value)>;
    /// Adds a channel to an already-open subscription, for per-sensor
    /// channels that only become relevant once a sensor gains a local
    /// subscriber.
    async fn subscribe_channel(&mut self, channel: &str) -> Result<()>;
}

#[async_trait]
impl BridgeStream for MessageStream {
    async fn next(&mut self) -> Option<(String, Value)> {
        self.next_message().await
    }

    async fn subscribe_channel(&mut self, channel: &str) -> Result<()> {
        MessageStream::subscribe_channel(self, channel).await
    }
}

#[async_trait]
impl Bus for CacheClient {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        CacheClient::publish(self, channel, payload).await
    }

    async fn add_active_connection(&self, connection_id: &str) -> Result<()> {
        CacheClient::add_active_connection(self, connection_id).await
    }

    async fn remove_active_connection(&self, connection_id: &str) -> Result<()> {
        CacheClient::remove_active_connection(self, connection_id).await
    }

    async fn update_sensor_status(&self, sensor_id: i64, streaming: bool, connections: usize) -> Result<()> {
        CacheClient::update_sensor_status(self, sensor_id, streaming, connections).await
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<Box<dyn BridgeStream>> {
        let stream = CacheClient::subscribe(self, channels).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_and_channels_are_bit_exact() {
        assert_eq!(stream_key(1), "stream:sensor:1");
        assert_eq!(features_key(1), "features:sensor:1:latest");
        assert_eq!(status_key(1), "status:sensor:1");
        assert_eq!(feature_channel(1), "sensor:1:features");
        assert_eq!(data_channel(1), "sensor:1:data");
        assert_eq!(CONNECTIONS_KEY, "connections:active");
        assert_eq!(ALERTS_QUEUE_KEY, "alerts:queue");
        assert_eq!(ALERTS_CHANNEL, "alerts:all");
        assert_eq!(BROADCAST_CHANNEL, "broadcast:all");
    }

    #[test]
    fn flatten_skips_nulls() {
        let v = serde_json::json!({"a": 1, "b": null, "c": "x"});
        let mut pairs = flatten_to_strings(&v);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![("a".to_string(), "1".to_string()), ("c".to_string(), "x".to_string())]
        );
    }
}
