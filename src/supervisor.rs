//! supervisor.rs
//! Lifecycle supervisor (C7): starts the bridge task and per-sensor
//! analyzers, runs the periodic idle-buffer reaper, and drains everything
//! on shutdown. Thin by design — `Pipeline` owns the actual handles, this
//! module only sequences them the way the original's `start_analysis` /
//! `stop_analysis` / `cleanup_old_buffers` did.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;

/// Called once at boot: starts the Pub/Sub bridge. Per-sensor analyzer
/// tasks are started lazily, on first sight of a sensor at the ingest
/// boundary (see `ensure_sensor_started`).
pub fn startup(pipeline: &Arc<Pipeline>) {
    pipeline.start_bridge();
}

pub fn ensure_sensor_started(pipeline: &Arc<Pipeline>, sensor_id: i64) {
    pipeline.start_analyzer(sensor_id);
}

/// Background task: every `max_idle_minutes`, drop buffers that haven't
/// seen a new window since the cutoff, stopping their analyzer first.
pub async fn run_housekeeping(pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let period = Duration::from_secs((pipeline.config.max_idle_minutes.max(1) as u64) * 60);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("housekeeping task cancelled");
                return;
            }
            _ = ticker.tick() => {
                pipeline.reap_idle_buffers().await;
            }
        }
    }
}

/// Stops the bridge, drains every analyzer task with a bounded timeout,
/// and closes the store/cache connections.
pub async fn shutdown(pipeline: &Arc<Pipeline>, housekeeping_cancel: &CancellationToken, drain_timeout: Duration) {
    housekeeping_cancel.cancel();
    let shutdown_fut = pipeline.shutdown();
    if tokio::time::timeout(drain_timeout, shutdown_fut).await.is_err() {
        log::warn!("pipeline shutdown exceeded {drain_timeout:?}, proceeding anyway");
    }
}
