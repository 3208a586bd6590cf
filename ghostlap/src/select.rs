//! Reference-lap selection (fastest, representative) and lap slicing.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{LapError, LapInterval, TelemetryFrame};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Minimum duration.
    #[default]
    Fastest,
    /// Duration nearest the median of valid durations.
    Representative,
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::Fastest => write!(f, "fastest"),
            SelectionPolicy::Representative => write!(f, "representative"),
        }
    }
}

/// Pick one lap according to `policy`.
///
/// Ties are broken by the earliest lap (smallest candidate index), so the
/// result does not depend on the order of `laps`.
pub fn select_lap(laps: &[LapInterval], policy: SelectionPolicy) -> Result<&LapInterval, LapError> {
    if laps.is_empty() {
        return Err(LapError::NoValidLap {
            min_lap_time: f64::NAN,
            candidates: 0,
        });
    }
    let chosen = match policy {
        SelectionPolicy::Fastest => argmin_by(laps, |lap| lap.duration),
        SelectionPolicy::Representative => {
            let mut durations: Vec<f64> = laps.iter().map(|l| l.duration).collect();
            let target = median(&mut durations);
            argmin_by(laps, |lap| (lap.duration - target).abs())
        }
    };
    Ok(chosen)
}

fn argmin_by<F: Fn(&LapInterval) -> f64>(laps: &[LapInterval], key: F) -> &LapInterval {
    let mut best = &laps[0];
    let mut best_key = key(best);
    for lap in &laps[1..] {
        let k = key(lap);
        if k < best_key || (k == best_key && lap.index < best.index) {
            best = lap;
            best_key = k;
        }
    }
    best
}

/// Median with the even-count convention of averaging the two middle values.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 0 {
        f64::NAN
    } else if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    }
}

/// One lap's telemetry with lap-relative time starting at zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LapRecord {
    pub lap: LapInterval,
    pub frame: TelemetryFrame,
    /// Seconds spent in each sector, once a sector split has been computed.
    pub sector_times: Option<Vec<(String, f64)>>,
}

impl LapRecord {
    pub fn duration(&self) -> f64 {
        self.lap.duration
    }

    pub fn with_sector_times(mut self, sector_times: Vec<(String, f64)>) -> Self {
        self.sector_times = Some(sector_times);
        self
    }
}

/// Slice `frame` to `[start_time, end_time)` and rebase so the first row is t=0.
pub fn extract_lap(frame: &TelemetryFrame, lap: &LapInterval) -> LapRecord {
    let slice = frame.slice_time(lap.start_time, lap.end_time);
    debug_assert!(
        !slice.is_empty(),
        "lap [{}, {}) selected no rows",
        lap.start_time,
        lap.end_time
    );
    let origin = slice
        .times
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let slice = if origin.is_finite() {
        slice.rebase(origin)
    } else {
        slice
    };
    LapRecord {
        lap: *lap,
        frame: slice,
        sector_times: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use std::collections::BTreeMap;

    fn laps_from(durations: &[f64]) -> Vec<LapInterval> {
        let mut start = 0.0;
        durations
            .iter()
            .enumerate()
            .map(|(index, &duration)| {
                let lap = LapInterval {
                    index,
                    start_time: start,
                    end_time: start + duration,
                    duration,
                };
                start += duration;
                lap
            })
            .collect()
    }

    #[test]
    fn fastest_is_global_minimum() {
        let laps = laps_from(&[72.0, 65.5, 90.0, 65.9]);
        let lap = select_lap(&laps, SelectionPolicy::Fastest).unwrap();
        assert_eq!(lap.index, 1);
    }

    #[test]
    fn fastest_is_order_independent_with_first_occurrence_ties() {
        let laps = laps_from(&[70.0, 65.0, 80.0, 65.0]);
        let mut shuffled = laps.clone();
        shuffled.reverse();
        let a = select_lap(&laps, SelectionPolicy::Fastest).unwrap();
        let b = select_lap(&shuffled, SelectionPolicy::Fastest).unwrap();
        assert_eq!(a.index, 1);
        assert_eq!(b.index, 1);
    }

    #[test]
    fn representative_is_nearest_to_median() {
        // median of [60.1, 65.0, 70.2, 300.0] is 67.6; 65.0 is closer than 70.2
        let laps = laps_from(&[60.1, 65.0, 70.2, 300.0]);
        let lap = select_lap(&laps, SelectionPolicy::Representative).unwrap();
        assert_eq!(lap.duration, 65.0);
        assert_eq!(lap.index, 1);
    }

    #[test]
    fn representative_odd_count_picks_median_element() {
        let laps = laps_from(&[61.0, 90.0, 75.0]);
        let lap = select_lap(&laps, SelectionPolicy::Representative).unwrap();
        assert_eq!(lap.duration, 75.0);
    }

    #[test]
    fn duplicate_durations_keep_their_own_index() {
        let laps = laps_from(&[80.0, 70.0, 70.0]);
        let lap = select_lap(&laps[1..], SelectionPolicy::Fastest).unwrap();
        assert_eq!(lap.index, 1);
        assert_eq!(lap.start_time, 80.0);
    }

    #[test]
    fn extract_rebases_time_to_zero() {
        let mut channels = BTreeMap::new();
        channels.insert(
            channel::SPEED.to_string(),
            vec![10.0, 20.0, 30.0, 40.0, 50.0],
        );
        let frame = TelemetryFrame {
            times: vec![99.0, 100.0, 130.0, 164.9, 165.0],
            channels,
        };
        let lap = LapInterval {
            index: 0,
            start_time: 100.0,
            end_time: 165.0,
            duration: 65.0,
        };
        let record = extract_lap(&frame, &lap);
        assert_eq!(record.frame.len(), 3);
        assert_eq!(record.frame.times[0], 0.0);
        assert!((record.frame.times[2] - 64.9).abs() < 1e-9);
        assert_eq!(record.frame.channel(channel::SPEED).unwrap(), &[20.0, 30.0, 40.0]);
        assert_eq!(record.duration(), 65.0);
    }

    #[test]
    fn empty_lap_list_fails() {
        assert!(select_lap(&[], SelectionPolicy::Fastest).is_err());
    }

    #[test]
    fn default_policy_is_fastest() {
        assert_eq!(SelectionPolicy::default(), SelectionPolicy::Fastest);
        assert_eq!(
            serde_json::to_string(&SelectionPolicy::Representative).unwrap(),
            "\"representative\""
        );
    }
}
