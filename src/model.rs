//! model.rs
//! Shared data types. `FeatureRecord` uses `chrono::DateTime<Utc>` for its
//! two timestamp fields uniformly: serializing to JSON yields RFC3339
//! strings (the broadcast form) and binding to a `sqlx` query yields a
//! native `timestamptz` (the durable-store form), so the analyzer never
//! needs to carry two parallel representations of the same record — it
//! builds the record once and reads it by reference at both the cache/
//! broadcast step and the persistence step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub h_acc: f64,
    pub v_acc: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub sensor_id: i64,
    pub buffer_size: usize,
    pub current_size: usize,
    pub sample_count: u64,
    pub window_start_ts: Option<DateTime<Utc>>,
    pub latest_ts: Option<DateTime<Utc>>,
}

/// Snapshot produced by `BufferStore::get_window`. Owns fresh copies of the
/// axis arrays so analyzer tasks never share a numeric buffer.
#[derive(Debug, Clone)]
pub struct Window {
    pub sensor_id: i64,
    pub window_start_ts: DateTime<Utc>,
    pub window_end_ts: DateTime<Utc>,
    pub h_data: Vec<f64>,
    pub v_data: Vec<f64>,
    pub n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub sensor_id: i64,
    pub window_start_ts: DateTime<Utc>,
    pub window_end_ts: DateTime<Utc>,
    pub rms_h: f64,
    pub rms_v: f64,
    pub peak_h: f64,
    pub peak_v: f64,
    pub kurtosis_h: f64,
    pub kurtosis_v: f64,
    pub crest_factor_h: f64,
    pub crest_factor_v: f64,
    pub fm0_h: Option<f64>,
    pub fm0_v: Option<f64>,
    pub dominant_freq_h: f64,
    pub dominant_freq_v: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfiguration {
    pub sensor_id: i64,
    pub feature_name: String,
    pub threshold_min: Option<f64>,
    pub threshold_max: Option<f64>,
    pub severity: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Option<i64>,
    pub sensor_id: i64,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub feature_name: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// A live subscriber's registration in the fan-out hub. `sensor_id = 0`
/// is the reserved "all sensors" sentinel.
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub subscription_id: Uuid,
    pub sensor_id: i64,
}

pub const ALL_SENSORS: i64 = 0;
