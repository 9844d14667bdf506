//! pipeline.rs
//! Wires C1..C7 into a single injectable value, replacing the original's
//! module-level globals (`buffer_manager`, `db`, `redis_client`, `manager`).
//! Constructed once at startup; tests construct their own with fakes in
//! place of `store`/`cache`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{self, AnalyzerConfig, FeatureCache, FeatureStore};
use crate::buffer::BufferStore;
use crate::cache::{Bus, CacheClient};
use crate::config::Config;
use crate::error::Result;
use crate::hub::FanoutHub;
use crate::store::DurableStore;

pub struct Pipeline {
    pub config: Config,
    pub buffers: Arc<BufferStore>,
    pub cache: Arc<CacheClient>,
    pub store: Arc<DurableStore>,
    pub hub: Arc<FanoutHub>,
    analyzer_tasks: Mutex<HashMap<i64, (CancellationToken, tokio::task::JoinHandle<()>)>>,
    bridge_task: Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl Pipeline {
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let cache = Arc::new(CacheClient::connect(&config.redis_url).await?);
        let store = Arc::new(DurableStore::connect(&config.database_url, config.durable_store_deadline_secs).await?);
        let bus: Arc<dyn Bus> = cache.clone();
        let hub = Arc::new(FanoutHub::new(bus));
        let buffers = Arc::new(BufferStore::new(config.buffer_capacity));

        Ok(Arc::new(Pipeline {
            config,
            buffers,
            cache,
            store,
            hub,
            analyzer_tasks: Mutex::new(HashMap::new()),
            bridge_task: Mutex::new(None),
        }))
    }

    fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            window_seconds: self.config.window_seconds,
            min_samples: self.config.min_samples,
            sampling_rate_hz: self.config.sampling_rate_hz,
            poll_interval: std::time::Duration::from_millis(self.config.analyzer_poll_interval_ms),
        }
    }

    /// Starts the per-sensor analyzer task if one isn't already running.
    pub fn start_analyzer(self: &Arc<Self>, sensor_id: i64) {
        let mut tasks = self.analyzer_tasks.lock();
        if tasks.contains_key(&sensor_id) {
            return;
        }
        let cancel = CancellationToken::new();
        let store: Arc<dyn FeatureStore> = self.store.clone();
        let cache: Arc<dyn FeatureCache> = self.cache.clone();
        let handle = tokio::spawn(analyzer::run_sensor_analyzer(
            sensor_id,
            self.buffers.clone(),
            store,
            cache,
            self.hub.clone(),
            self.analyzer_config(),
            cancel.clone(),
        ));
        tasks.insert(sensor_id, (cancel, handle));
        log::info!("started analyzer task for sensor {sensor_id}");
    }

    pub async fn stop_analyzer(&self, sensor_id: i64) {
        let entry = self.analyzer_tasks.lock().remove(&sensor_id);
        if let Some((cancel, handle)) = entry {
            cancel.cancel();
            let _ = handle.await;
            log::info!("stopped analyzer task for sensor {sensor_id}");
        }
    }

    pub fn start_bridge(self: &Arc<Self>) {
        let mut slot = self.bridge_task.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let hub = self.hub.clone();
        let handle = tokio::spawn(hub.run_bridge(cancel.clone()));
        *slot = Some((cancel, handle));
    }

    pub async fn stop_bridge(&self) {
        let entry = self.bridge_task.lock().take();
        if let Some((cancel, handle)) = entry {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Periodic idle-buffer reaper: drops buffers whose window hasn't moved
    /// in `max_idle_minutes`, stopping the matching analyzer task first.
    pub async fn reap_idle_buffers(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(self.config.max_idle_minutes);
        let idle = self.buffers.idle_since(cutoff);
        for sensor_id in idle {
            self.stop_analyzer(sensor_id).await;
            self.buffers.drop_buffer(sensor_id);
            log::info!("reaped idle buffer for sensor {sensor_id}");
        }
    }

    pub async fn shutdown(&self) {
        self.stop_bridge().await;
        let sensor_ids: Vec<i64> = self.analyzer_tasks.lock().keys().copied().collect();
        for sensor_id in sensor_ids {
            self.stop_analyzer(sensor_id).await;
        }
        self.store.close().await;
    }
}
