//! store.rs
//! Durable store client (C3): a pooled `sqlx::PgPool` wrapper exposing only
//! the operations the core actually calls. Queries are built and bound at
//! runtime (`sqlx::query`/`sqlx::query_as`, not the `query!` macros) since
//! this crate is never built against a live database or a `.sqlx` cache.

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::model::{Alert, AlertConfiguration, FeatureRecord, Sample};

pub struct DurableStore {
    pool: PgPool,
}

impl DurableStore {
    pub async fn connect(database_url: &str, acquire_timeout_secs: u64) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(10)
            .max_connections(50)
            .max_lifetime(std::time::Duration::from_secs(300))
            .acquire_timeout(std::time::Duration::from_secs(acquire_timeout_secs))
            .connect(database_url)
            .await?;
        Ok(DurableStore { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Bulk insert raw samples for one sensor in a single transaction.
    pub async fn insert_sensor_data(&self, sensor_id: i64, records: &[Sample]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "INSERT INTO sensor_data (sensor_id, timestamp, horizontal_acceleration, vertical_acceleration) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(sensor_id)
            .bind(r.timestamp)
            .bind(r.h_acc)
            .bind(r.v_acc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Single-row feature insert. Timestamps bind as native `timestamptz`;
    /// the caller's in-memory record (used for broadcast/cache) is read by
    /// reference here and never mutated.
    pub async fn insert_features(&self, sensor_id: i64, f: &FeatureRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO realtime_features \
             (sensor_id, window_start, window_end, rms_h, rms_v, peak_h, peak_v, \
              kurtosis_h, kurtosis_v, crest_factor_h, crest_factor_v, \
              fm0_h, fm0_v, dominant_freq_h, dominant_freq_v) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(sensor_id)
        .bind(f.window_start_ts)
        .bind(f.window_end_ts)
        .bind(f.rms_h)
        .bind(f.rms_v)
        .bind(f.peak_h)
        .bind(f.peak_v)
        .bind(f.kurtosis_h)
        .bind(f.kurtosis_v)
        .bind(f.crest_factor_h)
        .bind(f.crest_factor_v)
        .bind(f.fm0_h)
        .bind(f.fm0_v)
        .bind(f.dominant_freq_h)
        .bind(f.dominant_freq_v)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_alert_configurations(&self, sensor_id: i64) -> Result<Vec<AlertConfiguration>> {
        let rows = sqlx::query(
            "SELECT sensor_id, feature_name, threshold_min, threshold_max, severity, enabled \
             FROM alert_configurations WHERE sensor_id = $1 AND enabled = true",
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_alert_config).collect())
    }

    pub async fn create_alert(&self, alert: &Alert) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO alerts \
             (sensor_id, alert_type, severity, message, feature_name, current_value, threshold_value) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING alert_id",
        )
        .bind(alert.sensor_id)
        .bind(&alert.kind)
        .bind(&alert.severity)
        .bind(&alert.message)
        .bind(&alert.feature_name)
        .bind(alert.current_value)
        .bind(alert.threshold_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("alert_id")?)
    }

    pub async fn acknowledge_alert(&self, alert_id: i64, acknowledged_by: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET is_acknowledged = true, acknowledged_by = $2, acknowledged_at = NOW() \
             WHERE alert_id = $1",
        )
        .bind(alert_id)
        .bind(acknowledged_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn register_sensor(
        &self,
        sensor_id: i64,
        sensor_name: &str,
        sensor_type: &str,
        sampling_rate: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sensors (sensor_id, sensor_name, sensor_type, sampling_rate, is_active) \
             VALUES ($1, $2, $3, $4, true) \
             ON CONFLICT (sensor_id) DO UPDATE \
             SET is_active = true, sensor_name = EXCLUDED.sensor_name, \
                 sensor_type = EXCLUDED.sensor_type, sampling_rate = EXCLUDED.sampling_rate",
        )
        .bind(sensor_id)
        .bind(sensor_name)
        .bind(sensor_type)
        .bind(sampling_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sensor_status(&self, sensor_id: i64) -> Result<Option<SensorStatus>> {
        let row = sqlx::query("SELECT * FROM v_sensor_status WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| SensorStatus {
            sensor_id: r.try_get("sensor_id").unwrap_or(sensor_id),
            sensor_name: r.try_get("sensor_name").ok(),
            is_active: r.try_get("is_active").unwrap_or(false),
        }))
    }

    pub async fn stream_session_create(&self, sensor_id: i64, client_id: &str) -> Result<String> {
        let row = sqlx::query(
            "INSERT INTO stream_sessions (sensor_id, client_id) VALUES ($1, $2) RETURNING session_id",
        )
        .bind(sensor_id)
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<String, _>("session_id")?)
    }

    pub async fn stream_session_update(
        &self,
        session_id: &str,
        status: &str,
        bytes_received: Option<i64>,
        data_points: Option<i64>,
    ) -> Result<()> {
        let mut set_clauses = vec!["status = $2".to_string()];
        let mut idx = 2;
        if bytes_received.is_some() {
            idx += 1;
            set_clauses.push(format!("bytes_received = ${idx}"));
        }
        if data_points.is_some() {
            idx += 1;
            set_clauses.push(format!("data_points_received = ${idx}"));
        }
        if status == "closed" || status == "error" {
            set_clauses.push("disconnected_at = NOW()".to_string());
        }
        let sql = format!(
            "UPDATE stream_sessions SET {} WHERE session_id = $1",
            set_clauses.join(", ")
        );

        let mut q = sqlx::query(&sql).bind(session_id).bind(status);
        if let Some(b) = bytes_received {
            q = q.bind(b);
        }
        if let Some(d) = data_points {
            q = q.bind(d);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }
}

pub struct SensorStatus {
    pub sensor_id: i64,
    pub sensor_name: Option<String>,
    pub is_active: bool,
}

fn row_to_alert_config(row: &PgRow) -> AlertConfiguration {
    AlertConfiguration {
        sensor_id: row.try_get("sensor_id").unwrap_or_default(),
        feature_name: row.try_get("feature_name").unwrap_or_default(),
        threshold_min: row.try_get("threshold_min").ok(),
        threshold_max: row.try_get("threshold_max").ok(),
        severity: row.try_get("severity").unwrap_or_default(),
        enabled: row.try_get("enabled").unwrap_or(true),
    }
}
