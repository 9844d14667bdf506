//! hub.rs
//! Fan-out hub (C6): per-sensor subscriber sets with local delivery, plus a
//! background bridge task that mirrors broadcasts to/from C2's Pub/Sub bus
//! so multiple backend instances share one event stream. The `bridge` flag
//! threaded through every broadcast op is what stops a bridged message from
//! being re-published and cycling forever.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{self, Bus, BridgeStream};
use crate::error::{PipelineError, Result};
use crate::model::{Alert, FeatureRecord, ALL_SENSORS};

pub type Outbox = mpsc::UnboundedSender<Value>;

struct Indices {
    subs_by_sensor: HashMap<i64, HashMap<Uuid, Outbox>>,
    sub_to_sensor: HashMap<Uuid, i64>,
}

pub struct FanoutHub {
    indices: Mutex<Indices>,
    bus: Arc<dyn Bus>,
    // Set once `run_bridge` starts; `connect` uses it to ask the bridge task
    // to also subscribe to this sensor's per-sensor channels.
    bridge_subscribe: Mutex<Option<mpsc::UnboundedSender<i64>>>,
    bridge_subscribed_sensors: Mutex<HashSet<i64>>,
}

impl FanoutHub {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        FanoutHub {
            indices: Mutex::new(Indices {
                subs_by_sensor: HashMap::new(),
                sub_to_sensor: HashMap::new(),
            }),
            bus,
            bridge_subscribe: Mutex::new(None),
            bridge_subscribed_sensors: Mutex::new(HashSet::new()),
        }
    }

    pub async fn connect(&self, sub_id: Uuid, sensor_id: i64, out: Outbox) -> Result<()> {
        let connections = {
            let mut idx = self.indices.lock();
            idx.subs_by_sensor
                .entry(sensor_id)
                .or_default()
                .insert(sub_id, out);
            idx.sub_to_sensor.insert(sub_id, sensor_id);
            idx.subs_by_sensor.get(&sensor_id).map(|m| m.len()).unwrap_or(0)
        };

        let _ = self.bus.add_active_connection(&sub_id.to_string()).await;
        if sensor_id != ALL_SENSORS {
            let _ = self.bus.update_sensor_status(sensor_id, true, connections).await;
            if let Some(tx) = self.bridge_subscribe.lock().as_ref() {
                let _ = tx.send(sensor_id);
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self, sub_id: Uuid) {
        let (sensor_id, remaining) = {
            let mut idx = self.indices.lock();
            let sensor_id = idx.sub_to_sensor.remove(&sub_id);
            let mut remaining = 0;
            if let Some(s) = sensor_id {
                if let Some(set) = idx.subs_by_sensor.get_mut(&s) {
                    set.remove(&sub_id);
                    remaining = set.len();
                    if set.is_empty() {
                        idx.subs_by_sensor.remove(&s);
                    }
                }
            }
            (sensor_id, remaining)
        };

        let _ = self.bus.remove_active_connection(&sub_id.to_string()).await;
        if let Some(s) = sensor_id {
            if s != ALL_SENSORS {
                let _ = self.bus.update_sensor_status(s, remaining > 0, remaining).await;
            }
        }
    }

    pub async fn send_personal(&self, sub_id: Uuid, msg: Value) -> Result<()> {
        let sender = {
            let idx = self.indices.lock();
            idx.sub_to_sensor.get(&sub_id).and_then(|sensor_id| {
                idx.subs_by_sensor
                    .get(sensor_id)
                    .and_then(|m| m.get(&sub_id))
                    .cloned()
            })
        };
        match sender {
            Some(tx) if tx.send(msg).is_ok() => Ok(()),
            _ => {
                self.disconnect(sub_id).await;
                Err(PipelineError::SubscriberGone)
            }
        }
    }

    fn local_targets(&self, sensor_id: i64) -> Vec<(Uuid, Outbox)> {
        let idx = self.indices.lock();
        idx.subs_by_sensor
            .get(&sensor_id)
            .map(|m| m.iter().map(|(id, tx)| (*id, tx.clone())).collect())
            .unwrap_or_default()
    }

    async fn deliver(&self, targets: Vec<(Uuid, Outbox)>, msg: &Value) {
        let mut dead = Vec::new();
        for (sub_id, tx) in targets {
            if tx.send(msg.clone()).is_err() {
                dead.push(sub_id);
            }
        }
        for sub_id in dead {
            self.disconnect(sub_id).await;
        }
    }

    pub async fn broadcast_to_sensor(&self, sensor_id: i64, msg: Value, bridge: bool) {
        let targets = self.local_targets(sensor_id);
        self.deliver(targets, &msg).await;

        if bridge {
            match msg.get("type").and_then(Value::as_str) {
                Some("feature_update") => {
                    let _ = self.bus.publish(&cache::feature_channel(sensor_id), &msg).await;
                }
                Some("sensor_data") => {
                    let _ = self.bus.publish(&cache::data_channel(sensor_id), &msg).await;
                }
                _ => {}
            }
        }
    }

    pub async fn broadcast_to_all(&self, msg: Value, bridge: bool) {
        let sensor_ids: Vec<i64> = {
            let idx = self.indices.lock();
            idx.subs_by_sensor.keys().copied().collect()
        };
        for sensor_id in sensor_ids {
            let targets = self.local_targets(sensor_id);
            self.deliver(targets, &msg).await;
        }
        if bridge {
            let _ = self.bus.publish(cache::BROADCAST_CHANNEL, &msg).await;
        }
    }

    pub async fn broadcast_feature_update(&self, sensor_id: i64, record: &FeatureRecord, bridge: bool) {
        let payload = json!({
            "type": "feature_update",
            "sensor_id": sensor_id,
            "data": feature_record_json(record),
        });
        self.broadcast_to_sensor(sensor_id, payload, bridge).await;
    }

    pub async fn broadcast_sensor_data(&self, sensor_id: i64, data: Value, bridge: bool) {
        let payload = json!({
            "type": "sensor_data",
            "sensor_id": sensor_id,
            "data": data,
        });
        self.broadcast_to_sensor(sensor_id, payload, bridge).await;
    }

    pub async fn broadcast_alert(&self, alert: &Alert, bridge: bool) {
        let payload = json!({"type": "alert", "data": alert});
        self.broadcast_to_all(payload.clone(), bridge).await;
        if bridge {
            let _ = self.bus.publish(cache::ALERTS_CHANNEL, &payload).await;
        }
    }

    /// Background task: subscribes to the cluster-wide channels and
    /// re-dispatches received messages locally with `bridge = false`, so a
    /// message relayed through the bus is never re-published by the
    /// instance that relays it. Also subscribes to each sensor's
    /// `sensor:{id}:features`/`:data` channels as soon as that sensor gains
    /// a local subscriber — both sensors already subscribed when this task
    /// starts (catch-up) and ones that connect afterwards (via the
    /// `bridge_subscribe` channel fed from `connect`).
    pub async fn run_bridge(self: Arc<Self>, cancel: CancellationToken) {
        let channels = vec![
            cache::BROADCAST_CHANNEL.to_string(),
            cache::ALERTS_CHANNEL.to_string(),
        ];
        let mut stream = match self.bus.subscribe(channels).await {
            Ok(s) => s,
            Err(e) => {
                log::error!("bridge failed to subscribe: {e}");
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
        *self.bridge_subscribe.lock() = Some(tx);

        let already_connected: Vec<i64> = {
            let idx = self.indices.lock();
            idx.subs_by_sensor
                .keys()
                .copied()
                .filter(|id| *id != ALL_SENSORS)
                .collect()
        };
        for sensor_id in already_connected {
            self.subscribe_bridge_channels(stream.as_mut(), sensor_id).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("bridge task cancelled");
                    *self.bridge_subscribe.lock() = None;
                    return;
                }
                sensor_id = rx.recv() => {
                    let Some(sensor_id) = sensor_id else { continue };
                    self.subscribe_bridge_channels(stream.as_mut(), sensor_id).await;
                }
                msg = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next()) => {
                    let Ok(Some((channel, payload))) = msg else { continue };
                    self.dispatch_bridged(&channel, payload).await;
                }
            }
        }
    }

    /// Subscribes the live bridge stream to `sensor_id`'s per-sensor
    /// channels, deduplicated so a sensor already subscribed is a no-op.
    async fn subscribe_bridge_channels(&self, stream: &mut dyn BridgeStream, sensor_id: i64) {
        {
            let mut seen = self.bridge_subscribed_sensors.lock();
            if !seen.insert(sensor_id) {
                return;
            }
        }
        if let Err(e) = stream.subscribe_channel(&cache::feature_channel(sensor_id)).await {
            log::warn!("bridge failed to subscribe to sensor {sensor_id} features channel: {e}");
        }
        if let Err(e) = stream.subscribe_channel(&cache::data_channel(sensor_id)).await {
            log::warn!("bridge failed to subscribe to sensor {sensor_id} data channel: {e}");
        }
    }

    async fn dispatch_bridged(&self, channel: &str, payload: Value) {
        if channel == cache::BROADCAST_CHANNEL {
            self.broadcast_to_all(payload, false).await;
        } else if channel == cache::ALERTS_CHANNEL {
            if let Ok(alert) = serde_json::from_value::<Alert>(
                payload.get("data").cloned().unwrap_or(Value::Null),
            ) {
                self.broadcast_alert(&alert, false).await;
            }
        } else if let Some(id) = parse_sensor_channel(channel, ":features") {
            if let Some(record) = payload.get("data").cloned() {
                self.broadcast_to_sensor(
                    id,
                    json!({"type": "feature_update", "sensor_id": id, "data": record}),
                    false,
                )
                .await;
            }
        } else if let Some(id) = parse_sensor_channel(channel, ":data") {
            if let Some(data) = payload.get("data").cloned() {
                self.broadcast_sensor_data(id, data, false).await;
            }
        }
    }
}

fn parse_sensor_channel(channel: &str, suffix: &str) -> Option<i64> {
    let rest = channel.strip_prefix("sensor:")?;
    let id_str = rest.strip_suffix(suffix)?;
    id_str.parse().ok()
}

fn feature_record_json(record: &FeatureRecord) -> Value {
    let mut v = serde_json::to_value(record).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = v {
        map.insert("timestamp".to_string(), json!(record.window_end_ts.to_rfc3339()));
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    struct FakeBus {
        publishes: Mutex<Vec<(String, Value)>>,
        active_connections: AtomicUsize,
        bridge_subscriptions: Arc<Mutex<Vec<String>>>,
    }

    impl FakeBus {
        fn new() -> Arc<Self> {
            Arc::new(FakeBus {
                publishes: Mutex::new(Vec::new()),
                active_connections: AtomicUsize::new(0),
                bridge_subscriptions: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    #[async_trait]
    impl Bus for FakeBus {
        async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
            self.publishes.lock().push((channel.to_string(), payload.clone()));
            Ok(())
        }

        async fn add_active_connection(&self, _connection_id: &str) -> Result<()> {
            self.active_connections.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_active_connection(&self, _connection_id: &str) -> Result<()> {
            self.active_connections.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update_sensor_status(&self, _sensor_id: i64, _streaming: bool, _connections: usize) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, channels: Vec<String>) -> Result<Box<dyn cache::BridgeStream>> {
            self.bridge_subscriptions.lock().extend(channels);
            Ok(Box::new(FakeStream {
                subscribed: self.bridge_subscriptions.clone(),
            }))
        }
    }

    /// Fake `BridgeStream` that records every `subscribe_channel` call and
    /// otherwise never yields a message, so tests can drive `run_bridge`
    /// without a real Redis connection.
    struct FakeStream {
        subscribed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl cache::BridgeStream for FakeStream {
        async fn next(&mut self) -> Option<(String, Value)> {
            std::future::pending::<()>().await;
            None
        }

        async fn subscribe_channel(&mut self, channel: &str) -> Result<()> {
            self.subscribed.lock().push(channel.to_string());
            Ok(())
        }
    }

    #[test]
    fn parse_sensor_channel_extracts_id() {
        assert_eq!(parse_sensor_channel("sensor:42:features", ":features"), Some(42));
        assert_eq!(parse_sensor_channel("sensor:42:data", ":data"), Some(42));
        assert_eq!(parse_sensor_channel("alerts:all", ":features"), None);
    }

    #[tokio::test]
    async fn disconnect_mid_broadcast_removes_only_failed_subscriber() {
        let hub = FanoutHub::new(FakeBus::new());

        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, rx2) = unbounded_channel();
        let (tx3, mut rx3) = unbounded_channel();
        drop(rx2); // subscriber 2's receiver is gone, so its send will fail

        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let id3 = Uuid::new_v4();
        hub.connect(id1, 1, tx1).await.unwrap();
        hub.connect(id2, 1, tx2).await.unwrap();
        hub.connect(id3, 1, tx3).await.unwrap();

        hub.broadcast_to_sensor(1, json!({"type": "feature_update", "data": {}}), false).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());

        let idx = hub.indices.lock();
        let remaining = idx.subs_by_sensor.get(&1).unwrap();
        assert!(remaining.contains_key(&id1));
        assert!(!remaining.contains_key(&id2));
        assert!(remaining.contains_key(&id3));
        assert!(!idx.sub_to_sensor.contains_key(&id2));
    }

    #[tokio::test]
    async fn bridge_dispatch_does_not_republish() {
        let bus = FakeBus::new();
        let hub = FanoutHub::new(bus.clone());

        let (tx, mut rx) = unbounded_channel();
        let sub_id = Uuid::new_v4();
        hub.connect(sub_id, 1, tx).await.unwrap();

        // Simulate an externally-published feature_update being dispatched
        // by the bridge task (bridge = false).
        hub.dispatch_bridged(
            "sensor:1:features",
            json!({"data": {"rms_h": 0.3}}),
        )
        .await;

        let received = rx.try_recv().unwrap();
        assert_eq!(received["type"], "feature_update");
        assert_eq!(received["data"]["rms_h"], 0.3);

        // No publish call was made as a side effect of the bridged dispatch.
        assert!(bus.publishes.lock().is_empty());
    }

    #[tokio::test]
    async fn connect_drives_bridge_to_subscribe_per_sensor_channels() {
        let bus = FakeBus::new();
        let hub = Arc::new(FanoutHub::new(bus.clone()));
        let cancel = CancellationToken::new();

        let bridge_task = tokio::spawn(hub.clone().run_bridge(cancel.clone()));
        // Give the bridge task a chance to subscribe and install its mpsc sender.
        for _ in 0..100 {
            if hub.bridge_subscribe.lock().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let (tx, _rx) = unbounded_channel();
        let sub_id = Uuid::new_v4();
        hub.connect(sub_id, 7, tx).await.unwrap();

        let mut subscribed = Vec::new();
        for _ in 0..200 {
            subscribed = bus.bridge_subscriptions.lock().clone();
            if subscribed.iter().any(|c| c == "sensor:7:features") {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(subscribed.contains(&"sensor:7:features".to_string()));
        assert!(subscribed.contains(&"sensor:7:data".to_string()));

        cancel.cancel();
        let _ = bridge_task.await;
    }
}
