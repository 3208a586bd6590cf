//! Lap segmentation from start/finish resets of the cumulative lap-distance channel.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{channel, LapError, Params, TelemetryFrame};

/// A candidate lap bounded by two consecutive crossings, `[start_time, end_time)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapInterval {
    /// Position among all candidates in time order (valid or not).
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
}

impl LapInterval {
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start_time && t < self.end_time
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Segmentation {
    /// Timestamps of every detected crossing, ascending.
    pub crossings: Vec<f64>,
    /// Every interval between consecutive crossings.
    pub candidates: Vec<LapInterval>,
    /// Candidates strictly longer than the minimum lap time.
    pub laps: Vec<LapInterval>,
}

/// Timestamps of rows whose distance dropped by more than `threshold`
/// (a negative number) relative to the previous row.
pub fn find_crossings(times: &[f64], distance: &[f64], threshold: f64) -> Vec<f64> {
    distance
        .windows(2)
        .zip(times.iter().skip(1))
        .filter_map(|(w, &t)| (w[1] - w[0] < threshold).then_some(t))
        .collect()
}

/// Split a normalized frame into laps.
///
/// Fails with [`LapError::InsufficientData`] when fewer than two crossings are
/// found and with [`LapError::NoValidLap`] when no candidate is longer than
/// `params.min_lap_time`. Resets closer together than the minimum collapse
/// into one short candidate that is rejected.
pub fn segment_laps(frame: &TelemetryFrame, params: &Params) -> Result<Segmentation, LapError> {
    let distance = frame.channel(channel::DISTANCE).ok_or_else(|| {
        LapError::Data(format!("required channel '{}' not present", channel::DISTANCE))
    })?;
    let crossings = find_crossings(&frame.times, distance, params.lap_reset_threshold);
    debug!(crossings = crossings.len(), "detected lap crossings");
    if crossings.len() < 2 {
        return Err(LapError::InsufficientData {
            found: crossings.len(),
            threshold: params.lap_reset_threshold,
        });
    }

    let candidates: Vec<LapInterval> = crossings
        .windows(2)
        .enumerate()
        .map(|(index, w)| LapInterval {
            index,
            start_time: w[0],
            end_time: w[1],
            duration: w[1] - w[0],
        })
        .collect();

    let laps: Vec<LapInterval> = candidates
        .iter()
        .filter(|c| c.duration > params.min_lap_time)
        .copied()
        .collect();
    if laps.is_empty() {
        return Err(LapError::NoValidLap {
            min_lap_time: params.min_lap_time,
            candidates: candidates.len(),
        });
    }
    debug!(
        candidates = candidates.len(),
        valid = laps.len(),
        "segmented laps"
    );

    Ok(Segmentation {
        crossings,
        candidates,
        laps,
    })
}
