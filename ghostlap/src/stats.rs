//! Session-level lap statistics and distance-channel summaries.

use serde::{Deserialize, Serialize};

use super::LapInterval;

/// Post-session summary over the valid laps. Lap numbers are 1-based
/// positions in the valid-lap list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionStats {
    pub lap_count: usize,
    pub fastest_lap: usize,
    pub fastest_time: f64,
    pub slowest_lap: usize,
    pub slowest_time: f64,
    pub mean_time: f64,
    /// Sample standard deviation; `None` with fewer than two laps.
    pub std_dev: Option<f64>,
}

impl SessionStats {
    pub fn from_laps(laps: &[LapInterval]) -> Option<Self> {
        let first = laps.first()?;
        let (mut fastest_lap, mut fastest_time) = (1, first.duration);
        let (mut slowest_lap, mut slowest_time) = (1, first.duration);
        for (i, lap) in laps.iter().enumerate().skip(1) {
            if lap.duration < fastest_time {
                fastest_lap = i + 1;
                fastest_time = lap.duration;
            }
            if lap.duration > slowest_time {
                slowest_lap = i + 1;
                slowest_time = lap.duration;
            }
        }
        let durations: Vec<f64> = laps.iter().map(|l| l.duration).collect();
        Some(Self {
            lap_count: laps.len(),
            fastest_lap,
            fastest_time,
            slowest_lap,
            slowest_time,
            mean_time: mean(&durations),
            std_dev: sample_std(&durations),
        })
    }
}

/// Descriptive statistics of a distance channel, used to pick sector bounds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DistanceStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: Option<f64>,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl DistanceStats {
    /// NaN readings are ignored; `None` when nothing finite remains.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(Self {
            count: sorted.len(),
            mean: mean(&sorted),
            std_dev: sample_std(&sorted),
            min: sorted[0],
            q25: quantile(&sorted, 0.25),
            median: quantile(&sorted, 0.5),
            q75: quantile(&sorted, 0.75),
            max: sorted[sorted.len() - 1],
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laps(durations: &[f64]) -> Vec<LapInterval> {
        durations
            .iter()
            .enumerate()
            .map(|(index, &duration)| LapInterval {
                index,
                start_time: index as f64 * 100.0,
                end_time: index as f64 * 100.0 + duration,
                duration,
            })
            .collect()
    }

    #[test]
    fn session_summary() {
        let stats = SessionStats::from_laps(&laps(&[98.0, 96.5, 101.0, 96.5])).unwrap();
        assert_eq!(stats.lap_count, 4);
        assert_eq!((stats.fastest_lap, stats.fastest_time), (2, 96.5));
        assert_eq!((stats.slowest_lap, stats.slowest_time), (3, 101.0));
        assert!((stats.mean_time - 98.0).abs() < 1e-9);
        // sample std of [98, 96.5, 101, 96.5]
        assert!((stats.std_dev.unwrap() - 2.1213203435596424).abs() < 1e-9);
    }

    #[test]
    fn single_lap_has_no_spread() {
        let stats = SessionStats::from_laps(&laps(&[90.0])).unwrap();
        assert_eq!(stats.std_dev, None);
        assert!(SessionStats::from_laps(&[]).is_none());
    }

    #[test]
    fn distance_quartiles_interpolate() {
        let stats = DistanceStats::from_values(&[0.0, f64::NAN, 10.0, 20.0, 30.0, 40.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.q25, 10.0);
        assert_eq!(stats.median, 20.0);
        assert_eq!(stats.q75, 30.0);
        assert_eq!(stats.max, 40.0);

        let even = DistanceStats::from_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((even.q25 - 1.75).abs() < 1e-12);
        assert!((even.median - 2.5).abs() < 1e-12);
        assert!(DistanceStats::from_values(&[f64::NAN]).is_none());
    }
}
