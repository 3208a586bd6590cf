//! Fixed-step resampling of two lap records onto one shared time grid.

use std::collections::BTreeMap;

use ndarray::Array1;
use tracing::debug;

use super::telemetry::{backward_fill, forward_fill};
use super::{LapError, LapRecord, TelemetryFrame};

/// One lap's channels on the shared grid.
#[derive(Clone, Debug)]
pub struct ResampledLap {
    pub duration: f64,
    pub channels: BTreeMap<String, Array1<f64>>,
}

impl ResampledLap {
    pub fn channel(&self, name: &str) -> Option<&Array1<f64>> {
        self.channels.get(name)
    }

    /// False when the channel was never recorded for this lap.
    pub fn has_data(&self, name: &str) -> bool {
        self.channel(name)
            .map(|c| c.iter().any(|v| v.is_finite()))
            .unwrap_or(false)
    }

    pub fn value_at(&self, name: &str, idx: usize) -> f64 {
        self.channel(name)
            .and_then(|c| c.get(idx).copied())
            .unwrap_or(f64::NAN)
    }
}

/// Ghost and live laps resampled onto an identical, strictly increasing grid.
#[derive(Clone, Debug)]
pub struct AlignedPair {
    pub step: f64,
    pub times: Array1<f64>,
    pub ghost: ResampledLap,
    pub live: ResampledLap,
}

impl AlignedPair {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Nearest grid index for a lap-relative time, clamped to the grid.
    pub fn index_at(&self, time_s: f64) -> Option<usize> {
        if self.times.is_empty() || time_s.is_nan() {
            return None;
        }
        let raw = (time_s / self.step).round();
        let last = self.times.len() - 1;
        Some(if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(last)
        })
    }
}

/// `[0, span)` at `step`, computed as `i * step` to avoid accumulated drift.
pub fn fixed_grid(span: f64, step: f64) -> Array1<f64> {
    if !(span.is_finite() && step.is_finite()) || span <= 0.0 || step <= 0.0 {
        return Array1::zeros(0);
    }
    let n = (span / step * (1.0 - 1e-12)).ceil() as usize;
    Array1::from_shape_fn(n, |i| i as f64 * step)
}

/// Time-weighted linear interpolation of every requested channel at the grid
/// points, followed by forward then backward fill of the edges. Channels the
/// frame lacks come back all-NaN.
pub fn resample_onto(
    frame: &TelemetryFrame,
    grid: &Array1<f64>,
    channels: &[String],
) -> BTreeMap<String, Array1<f64>> {
    channels
        .iter()
        .map(|name| {
            let column = match frame.channel(name) {
                Some(values) => interpolate_column(&frame.times, values, grid),
                None => Array1::from_elem(grid.len(), f64::NAN),
            };
            (name.clone(), column)
        })
        .collect()
}

fn interpolate_column(times: &[f64], values: &[f64], grid: &Array1<f64>) -> Array1<f64> {
    let points: Vec<(f64, f64)> = times
        .iter()
        .zip(values)
        .filter(|(t, v)| t.is_finite() && v.is_finite())
        .map(|(&t, &v)| (t, v))
        .collect();
    if points.is_empty() {
        return Array1::from_elem(grid.len(), f64::NAN);
    }

    let mut out = Vec::with_capacity(grid.len());
    let mut idx = 0;
    for &target in grid.iter() {
        while idx + 1 < points.len() && points[idx + 1].0 <= target {
            idx += 1;
        }
        let (t0, v0) = points[idx];
        if target == t0 {
            out.push(v0);
        } else if target < t0 || idx + 1 >= points.len() {
            // outside the recorded span; filled below
            out.push(f64::NAN);
        } else {
            let (t1, v1) = points[idx + 1];
            let frac = if (t1 - t0).abs() > f64::EPSILON {
                ((target - t0) / (t1 - t0)).clamp(0.0, 1.0)
            } else {
                0.0
            };
            out.push(v0 + (v1 - v0) * frac);
        }
    }
    forward_fill(&mut out);
    backward_fill(&mut out);
    Array1::from_vec(out)
}

/// Resample `ghost` and `live` onto `[0, max(ghost, live duration))` at `step`.
pub fn align(
    ghost: &LapRecord,
    live: &LapRecord,
    step: f64,
    channels: &[String],
) -> Result<AlignedPair, LapError> {
    if !step.is_finite() || step <= 0.0 {
        return Err(LapError::InvalidParameter(format!(
            "resample step must be > 0, got {}",
            step
        )));
    }
    let span = ghost.duration().max(live.duration());
    let times = fixed_grid(span, step);
    if times.is_empty() {
        return Err(LapError::InvalidParameter(format!(
            "cannot build a grid over a {}s span",
            span
        )));
    }

    let ghost_lap = ResampledLap {
        duration: ghost.duration(),
        channels: resample_onto(&ghost.frame, &times, channels),
    };
    let live_lap = ResampledLap {
        duration: live.duration(),
        channels: resample_onto(&live.frame, &times, channels),
    };
    debug!(points = times.len(), step, span, "aligned lap pair");

    Ok(AlignedPair {
        step,
        times,
        ghost: ghost_lap,
        live: live_lap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel, LapInterval};

    fn record(times: Vec<f64>, speed: Vec<f64>, duration: f64) -> LapRecord {
        let mut channels = BTreeMap::new();
        channels.insert(channel::SPEED.to_string(), speed);
        LapRecord {
            lap: LapInterval {
                index: 0,
                start_time: 0.0,
                end_time: duration,
                duration,
            },
            frame: TelemetryFrame { times, channels },
            sector_times: None,
        }
    }

    fn speed_only() -> Vec<String> {
        vec![channel::SPEED.to_string()]
    }

    #[test]
    fn grid_is_half_open_and_drift_free() {
        let grid = fixed_grid(65.0, 0.01);
        assert_eq!(grid.len(), 6500);
        assert_eq!(grid[0], 0.0);
        assert!((grid[6499] - 64.99).abs() < 1e-9);
        assert!(fixed_grid(0.0, 0.01).is_empty());
    }

    #[test]
    fn interpolates_linearly_in_time() {
        let grid = Array1::from_vec(vec![0.0, 0.25, 0.5, 1.0]);
        let out = interpolate_column(&[0.0, 1.0], &[0.0, 10.0], &grid);
        assert_eq!(out.to_vec(), vec![0.0, 2.5, 5.0, 10.0]);
    }

    #[test]
    fn skips_missing_readings_when_interpolating() {
        let grid = Array1::from_vec(vec![1.0]);
        let out = interpolate_column(&[0.0, 1.0, 2.0], &[0.0, f64::NAN, 20.0], &grid);
        assert!((out[0] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn edges_are_filled_from_nearest_sample() {
        let grid = Array1::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let out = interpolate_column(&[1.0, 3.0], &[10.0, 30.0], &grid);
        assert_eq!(out.to_vec(), vec![10.0, 10.0, 20.0, 30.0, 30.0]);
    }

    #[test]
    fn resampling_at_native_spacing_matches_nearest_lookup() {
        let times: Vec<f64> = (0..120).map(|i| i as f64 * 0.5).collect();
        let speed: Vec<f64> = times.iter().map(|t| 150.0 + 30.0 * (t / 7.0).sin()).collect();
        let rec = record(times.clone(), speed.clone(), 60.0);
        let pair = align(&rec, &rec, 0.5, &speed_only()).unwrap();
        assert_eq!(pair.len(), times.len());
        let resampled = pair.ghost.channel(channel::SPEED).unwrap();
        for (i, &t) in pair.times.iter().enumerate() {
            let nearest = times
                .iter()
                .enumerate()
                .min_by(|a, b| (a.1 - t).abs().partial_cmp(&(b.1 - t).abs()).unwrap())
                .map(|(j, _)| speed[j])
                .unwrap();
            assert!((resampled[i] - nearest).abs() < 1e-9);
        }
    }

    #[test]
    fn both_laps_share_one_grid_spanning_the_longer_lap() {
        let ghost = record(vec![0.0, 5.0, 9.9], vec![100.0, 110.0, 120.0], 10.0);
        let mut live = record(vec![0.0, 6.0, 11.9], vec![90.0, 100.0, 110.0], 12.0);
        live.frame.channels.clear();
        live.frame
            .channels
            .insert(channel::THROTTLE.to_string(), vec![0.0, 50.0, 100.0]);
        let pair = align(&ghost, &live, 0.01, &speed_only()).unwrap();
        assert_eq!(pair.len(), 1200);
        assert_eq!(pair.ghost.channel(channel::SPEED).unwrap().len(), 1200);
        assert_eq!(pair.live.channel(channel::SPEED).unwrap().len(), 1200);
        // ghost ends at 9.9 s; the tail is forward-filled
        assert_eq!(pair.ghost.value_at(channel::SPEED, 1199), 120.0);
        // live never recorded speed: all-NaN column rather than an error
        assert!(!pair.live.has_data(channel::SPEED));
        assert!(pair.ghost.has_data(channel::SPEED));
        for w in pair.times.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn index_lookup_is_nearest_and_clamped() {
        let rec = record(vec![0.0, 1.0], vec![1.0, 2.0], 1.0);
        let pair = align(&rec, &rec, 0.1, &speed_only()).unwrap();
        assert_eq!(pair.len(), 10);
        assert_eq!(pair.index_at(0.34), Some(3));
        assert_eq!(pair.index_at(-5.0), Some(0));
        assert_eq!(pair.index_at(50.0), Some(9));
        assert_eq!(pair.index_at(f64::NAN), None);
    }

    #[test]
    fn rejects_zero_step() {
        let rec = record(vec![0.0], vec![1.0], 1.0);
        assert!(matches!(
            align(&rec, &rec, 0.0, &speed_only()),
            Err(LapError::InvalidParameter(_))
        ));
    }
}
