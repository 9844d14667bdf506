//! ingest.rs
//! HTTP ingest endpoint (C4): the only write path into C1. Validates the
//! payload, appends to the ring buffer, mirrors the batch to C2's stream,
//! and lazily starts the sensor's analyzer task — everything else about a
//! sensor's lifecycle follows from its first sample arriving here. Raw
//! samples are never written to C3: only derived features and alerts are
//! durable, so `DurableStore::insert_sensor_data` has no caller here.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{PipelineError, Result};
use crate::model::{Sample, ALL_SENSORS};
use crate::pipeline::Pipeline;
use crate::supervisor;

#[derive(Debug, Deserialize)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub h_acc: f64,
    pub v_acc: f64,
}

#[derive(Debug, Deserialize)]
pub struct IngestBatch {
    pub sensor_id: i64,
    pub data: Vec<RawSample>,
}

fn to_samples(raw: Vec<RawSample>) -> Vec<Sample> {
    raw.into_iter()
        .map(|r| Sample {
            timestamp: r.timestamp,
            h_acc: r.h_acc,
            v_acc: r.v_acc,
        })
        .collect()
}

async fn ingest_samples(pipeline: &Arc<Pipeline>, sensor_id: i64, samples: Vec<Sample>) -> Result<usize> {
    if sensor_id == ALL_SENSORS {
        return Err(PipelineError::BadRequest("sensor_id 0 is reserved".to_string()));
    }
    if samples.is_empty() {
        return Err(PipelineError::BadRequest("data must not be empty".to_string()));
    }

    pipeline.buffers.append_batch(sensor_id, &samples);
    supervisor::ensure_sensor_started(pipeline, sensor_id);

    if let Err(e) = pipeline.cache.stream_append_batch(sensor_id, &samples).await {
        log::warn!("stream append failed for sensor {sensor_id}: {e}");
    }

    Ok(samples.len())
}

/// `POST /api/sensor/data` — batch ingest, one request per window or less.
pub async fn ingest_batch(
    State(pipeline): State<Arc<Pipeline>>,
    Json(batch): Json<IngestBatch>,
) -> Result<Json<Value>> {
    let count = ingest_samples(&pipeline, batch.sensor_id, to_samples(batch.data)).await?;
    Ok(Json(json!({"status": "success", "samples_received": count})))
}

#[derive(Debug, Deserialize)]
pub struct StreamBatch {
    pub sensor_id: i64,
    pub h_acc: Vec<f64>,
    pub v_acc: Vec<f64>,
    pub timestamp_start: DateTime<Utc>,
    pub sampling_rate: f64,
}

fn expand_stream_batch(batch: StreamBatch) -> Result<(i64, Vec<Sample>)> {
    if batch.h_acc.len() != batch.v_acc.len() {
        return Err(PipelineError::BadRequest(
            "h_acc and v_acc must have equal length".to_string(),
        ));
    }
    if batch.sampling_rate <= 0.0 {
        return Err(PipelineError::BadRequest("sampling_rate must be positive".to_string()));
    }

    let samples = batch
        .h_acc
        .into_iter()
        .zip(batch.v_acc)
        .enumerate()
        .map(|(i, (h_acc, v_acc))| {
            let offset_secs = i as f64 / batch.sampling_rate;
            let timestamp = batch.timestamp_start + chrono::Duration::microseconds((offset_secs * 1_000_000.0) as i64);
            Sample { timestamp, h_acc, v_acc }
        })
        .collect();

    Ok((batch.sensor_id, samples))
}

/// `POST /api/sensor/data/stream` — parallel-array variant used by
/// high-rate streaming clients: timestamps are synthesized from
/// `timestamp_start + i / sampling_rate` rather than sent per sample.
pub async fn ingest_stream(
    State(pipeline): State<Arc<Pipeline>>,
    Json(batch): Json<StreamBatch>,
) -> Result<Json<Value>> {
    let (sensor_id, samples) = expand_stream_batch(batch)?;
    let count = ingest_samples(&pipeline, sensor_id, samples).await?;
    Ok(Json(json!({"status": "success", "samples_received": count})))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(secs: i64) -> RawSample {
        RawSample {
            timestamp: DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(secs),
            h_acc: 1.0,
            v_acc: 0.0,
        }
    }

    #[test]
    fn to_samples_preserves_order() {
        let raw = vec![sample(0), sample(1), sample(2)];
        let samples = to_samples(raw);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].timestamp, DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(1));
    }

    #[test]
    fn stream_batch_synthesizes_timestamps_from_start_and_rate() {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        let batch = StreamBatch {
            sensor_id: 1,
            h_acc: vec![1.0, 2.0, 3.0, 4.0],
            v_acc: vec![0.0, 0.0, 0.0, 0.0],
            timestamp_start: start,
            sampling_rate: 4.0,
        };
        let (sensor_id, samples) = expand_stream_batch(batch).unwrap();
        assert_eq!(sensor_id, 1);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].timestamp, start);
        assert_eq!(samples[1].timestamp, start + chrono::Duration::milliseconds(250));
        assert_eq!(samples[3].timestamp, start + chrono::Duration::milliseconds(750));
    }

    #[test]
    fn stream_batch_rejects_mismatched_axis_lengths() {
        let batch = StreamBatch {
            sensor_id: 1,
            h_acc: vec![1.0, 2.0],
            v_acc: vec![0.0],
            timestamp_start: DateTime::<Utc>::UNIX_EPOCH,
            sampling_rate: 100.0,
        };
        assert!(expand_stream_batch(batch).is_err());
    }
}
