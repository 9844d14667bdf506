//! buffer.rs
//! Per-sensor ring buffer (C1). Mirrors the original circular-buffer module:
//! two index-aligned deques bounded at `N_buf`, a lazily-created map of
//! buffers guarded by one coarse mutex, and the 50%-fallback windowing
//! policy that tolerates irregular sample timestamps.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use crate::model::{BufferStats, Sample, Window};

/// Circular buffer for a single sensor's samples.
pub struct SensorBuffer {
    sensor_id: i64,
    capacity: usize,
    samples: VecDeque<(f64, f64)>,
    timestamps: VecDeque<DateTime<Utc>>,
    window_start_ts: Option<DateTime<Utc>>,
    sample_count: u64,
    // Tracked separately from `timestamps.back()`: an out-of-order append
    // (an older sample arriving late) must not regress this.
    latest_ts: Option<DateTime<Utc>>,
}

impl SensorBuffer {
    fn new(sensor_id: i64, capacity: usize) -> Self {
        SensorBuffer {
            sensor_id,
            capacity,
            samples: VecDeque::with_capacity(capacity),
            timestamps: VecDeque::with_capacity(capacity),
            window_start_ts: None,
            sample_count: 0,
            latest_ts: None,
        }
    }

    fn append_one(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
            self.timestamps.pop_front();
        }
        self.samples.push_back((sample.h_acc, sample.v_acc));
        self.timestamps.push_back(sample.timestamp);
        self.sample_count += 1;

        if self.window_start_ts.is_none() {
            self.window_start_ts = Some(sample.timestamp);
        }
        self.latest_ts = Some(match self.latest_ts {
            Some(current) if current >= sample.timestamp => current,
            _ => sample.timestamp,
        });
    }

    fn latest_ts(&self) -> Option<DateTime<Utc>> {
        self.latest_ts
    }

    fn get_window(&self, window_seconds: f64) -> Option<Window> {
        if self.samples.is_empty() {
            return None;
        }

        let window_end = self.latest_ts.unwrap();
        let window_start =
            window_end - ChronoDuration::milliseconds((window_seconds * 1000.0) as i64);

        let mut h_data = Vec::new();
        let mut v_data = Vec::new();
        let mut first_ts = None;

        for (ts, (h, v)) in self.timestamps.iter().zip(self.samples.iter()) {
            if *ts >= window_start {
                if first_ts.is_none() {
                    first_ts = Some(*ts);
                }
                h_data.push(*h);
                v_data.push(*v);
            }
        }

        // Fallback: fewer than 50% of the buffer fell inside the strict
        // window (irregular timestamps) — return the whole buffer instead
        // of a possibly-stale singleton.
        if h_data.len() < self.samples.len() / 2 {
            h_data = self.samples.iter().map(|(h, _)| *h).collect();
            v_data = self.samples.iter().map(|(_, v)| *v).collect();
            first_ts = self.timestamps.front().copied();
        }

        if h_data.is_empty() {
            return None;
        }

        Some(Window {
            sensor_id: self.sensor_id,
            window_start_ts: first_ts.unwrap(),
            window_end_ts: window_end,
            n: h_data.len(),
            h_data,
            v_data,
        })
    }

    fn is_ready(&self, min_samples: usize) -> bool {
        self.samples.len() >= min_samples
    }

    fn stats(&self) -> BufferStats {
        BufferStats {
            sensor_id: self.sensor_id,
            buffer_size: self.capacity,
            current_size: self.samples.len(),
            sample_count: self.sample_count,
            window_start_ts: self.window_start_ts,
            latest_ts: self.latest_ts(),
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.timestamps.clear();
        self.window_start_ts = None;
        self.sample_count = 0;
    }
}

/// Owns every sensor's buffer behind a single coarse mutex. Critical
/// sections are brief: append/snapshot only, never held across I/O.
pub struct BufferStore {
    capacity: usize,
    buffers: Mutex<HashMap<i64, SensorBuffer>>,
}

impl BufferStore {
    pub fn new(capacity: usize) -> Self {
        BufferStore {
            capacity,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn append(&self, sensor_id: i64, sample: Sample) {
        let mut buffers = self.buffers.lock();
        let buf = buffers
            .entry(sensor_id)
            .or_insert_with(|| SensorBuffer::new(sensor_id, self.capacity));
        buf.append_one(sample);
    }

    pub fn append_batch(&self, sensor_id: i64, samples: &[Sample]) {
        let mut buffers = self.buffers.lock();
        let buf = buffers
            .entry(sensor_id)
            .or_insert_with(|| SensorBuffer::new(sensor_id, self.capacity));
        for sample in samples {
            buf.append_one(*sample);
        }
    }

    pub fn get_window(&self, sensor_id: i64, window_seconds: f64) -> Option<Window> {
        let buffers = self.buffers.lock();
        buffers.get(&sensor_id).and_then(|b| b.get_window(window_seconds))
    }

    pub fn is_ready(&self, sensor_id: i64, min_samples: usize) -> bool {
        let buffers = self.buffers.lock();
        buffers
            .get(&sensor_id)
            .map(|b| b.is_ready(min_samples))
            .unwrap_or(false)
    }

    pub fn stats(&self, sensor_id: i64) -> Option<BufferStats> {
        let buffers = self.buffers.lock();
        buffers.get(&sensor_id).map(|b| b.stats())
    }

    pub fn all_stats(&self) -> Vec<BufferStats> {
        let buffers = self.buffers.lock();
        buffers.values().map(|b| b.stats()).collect()
    }

    pub fn clear(&self, sensor_id: i64) {
        let mut buffers = self.buffers.lock();
        if let Some(b) = buffers.get_mut(&sensor_id) {
            b.clear();
        }
    }

    pub fn drop_buffer(&self, sensor_id: i64) {
        let mut buffers = self.buffers.lock();
        buffers.remove(&sensor_id);
    }

    /// Sensor ids whose buffer hasn't seen a first sample since `cutoff`.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<i64> {
        let buffers = self.buffers.lock();
        buffers
            .iter()
            .filter_map(|(id, b)| match b.window_start_ts {
                Some(ts) if ts < cutoff => Some(*id),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(secs: i64, h: f64, v: f64) -> Sample {
        Sample {
            timestamp: DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(secs),
            h_acc: h,
            v_acc: v,
        }
    }

    #[test]
    fn empty_window_is_none() {
        let store = BufferStore::new(100);
        assert!(store.get_window(7, 1.0).is_none());
    }

    #[test]
    fn append_batch_preserves_order_and_count() {
        let store = BufferStore::new(100);
        let batch: Vec<Sample> = (0..10).map(|i| sample(i, i as f64, 0.0)).collect();
        store.append_batch(1, &batch);
        let window = store.get_window(1, 100.0).unwrap();
        assert_eq!(window.n, 10);
        assert_eq!(window.h_data, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let store = BufferStore::new(5);
        let batch: Vec<Sample> = (0..10).map(|i| sample(i, i as f64, 0.0)).collect();
        store.append_batch(1, &batch);
        let stats = store.stats(1).unwrap();
        assert_eq!(stats.current_size, 5);
        assert_eq!(stats.sample_count, 10);
        let window = store.get_window(1, 100.0).unwrap();
        assert_eq!(window.h_data, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn strict_window_fallback_returns_whole_buffer() {
        let store = BufferStore::new(100);
        // 10 samples spread one per second; asking for a 1s window would
        // normally only match the last sample (10% of the buffer).
        let batch: Vec<Sample> = (0..10).map(|i| sample(i, i as f64, 0.0)).collect();
        store.append_batch(1, &batch);
        let window = store.get_window(1, 1.0).unwrap();
        assert_eq!(window.n, 10);
    }

    #[test]
    fn is_ready_respects_min_samples() {
        let store = BufferStore::new(100);
        let batch: Vec<Sample> = (0..9).map(|i| sample(i, 0.0, 0.0)).collect();
        store.append_batch(1, &batch);
        assert!(!store.is_ready(1, 10));
        store.append(1, sample(9, 0.0, 0.0));
        assert!(store.is_ready(1, 10));
    }

    #[test]
    fn drop_then_read_reports_empty() {
        let store = BufferStore::new(100);
        store.append(1, sample(0, 1.0, 1.0));
        store.drop_buffer(1);
        assert!(store.get_window(1, 1.0).is_none());
    }

    #[test]
    fn out_of_order_append_does_not_regress_latest_ts() {
        let store = BufferStore::new(100);
        store.append(1, sample(5, 1.0, 0.0));
        store.append(1, sample(3, 2.0, 0.0)); // arrives late, older timestamp
        let stats = store.stats(1).unwrap();
        assert_eq!(stats.latest_ts, Some(DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(5)));
        let window = store.get_window(1, 100.0).unwrap();
        assert_eq!(window.window_end_ts, DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(5));
    }
}
