//! features.rs
//! Time- and frequency-domain feature extraction for one axis of a window.
//! All five statistics are pure functions of a single `&[f64]` slice so they
//! can be unit-tested independently of the buffer/analyzer plumbing.

use rustfft::{FftPlanner, num_complex::Complex};

#[derive(Debug, Clone, Copy, Default)]
pub struct AxisFeatures {
    pub rms: f64,
    pub peak: f64,
    pub kurtosis: f64,
    pub crest_factor: f64,
    pub dominant_freq: f64,
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

pub fn rms(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let mean_sq = x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64;
    finite_or_zero(mean_sq.sqrt())
}

pub fn peak(x: &[f64]) -> f64 {
    finite_or_zero(x.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())))
}

pub fn kurtosis(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let variance = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std == 0.0 {
        return 0.0;
    }
    let fourth = x
        .iter()
        .map(|v| ((v - mean) / std).powi(4))
        .sum::<f64>()
        / n;
    finite_or_zero(fourth)
}

pub fn crest_factor(peak: f64, rms: f64) -> f64 {
    if rms == 0.0 {
        0.0
    } else {
        finite_or_zero(peak / rms)
    }
}

/// Dominant frequency via DFT magnitude spectrum, positive half only,
/// skipping the DC bin. Returns 0 for windows of one sample or fewer.
pub fn dominant_frequency(x: &[f64], sampling_rate_hz: f64) -> f64 {
    let n = x.len();
    if n <= 1 {
        return 0.0;
    }

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft.process(&mut buffer);

    let half = n / 2;
    let mut best_idx = 0usize;
    let mut best_mag = f64::NEG_INFINITY;
    for (i, bin) in buffer.iter().enumerate().take(half).skip(1) {
        let mag = bin.norm();
        if mag > best_mag {
            best_mag = mag;
            best_idx = i;
        }
    }

    if best_idx == 0 {
        return 0.0;
    }

    finite_or_zero((best_idx as f64 * sampling_rate_hz / n as f64).abs())
}

pub fn extract_axis(x: &[f64], sampling_rate_hz: f64) -> AxisFeatures {
    let rms_v = rms(x);
    let peak_v = peak(x);
    AxisFeatures {
        rms: rms_v,
        peak: peak_v,
        kurtosis: kurtosis(x),
        crest_factor: crest_factor(peak_v, rms_v),
        dominant_freq: dominant_frequency(x, sampling_rate_hz),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_signal_matches_scenario_3() {
        let h = vec![1.0; 10_000];
        let v = vec![0.0; 10_000];
        let fh = extract_axis(&h, 25_600.0);
        let fv = extract_axis(&v, 25_600.0);

        assert!((fh.rms - 1.0).abs() < 1e-9);
        assert!((fh.peak - 1.0).abs() < 1e-9);
        assert!((fh.crest_factor - 1.0).abs() < 1e-9);
        assert_eq!(fh.kurtosis, 0.0);
        assert_eq!(fh.dominant_freq, 0.0);

        assert_eq!(fv.rms, 0.0);
        assert_eq!(fv.peak, 0.0);
        assert_eq!(fv.crest_factor, 0.0);
    }

    #[test]
    fn empty_slice_is_all_zero() {
        let f = extract_axis(&[], 25_600.0);
        assert_eq!(f.rms, 0.0);
        assert_eq!(f.peak, 0.0);
        assert_eq!(f.kurtosis, 0.0);
        assert_eq!(f.crest_factor, 0.0);
        assert_eq!(f.dominant_freq, 0.0);
    }

    #[test]
    fn sine_wave_dominant_frequency_matches_bin() {
        let n = 1024;
        let sampling_rate = 1024.0;
        let target_freq = 64.0;
        let x: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * target_freq * i as f64 / sampling_rate).sin())
            .collect();
        let freq = dominant_frequency(&x, sampling_rate);
        assert!((freq - target_freq).abs() < 1.0);
    }

    #[test]
    fn no_field_is_nan_or_infinite() {
        let x = vec![f64::NAN, 1.0, 2.0];
        let f = extract_axis(&x, 25_600.0);
        assert!(f.rms.is_finite());
        assert!(f.peak.is_finite());
        assert!(f.kurtosis.is_finite());
        assert!(f.crest_factor.is_finite());
        assert!(f.dominant_freq.is_finite());
    }
}
