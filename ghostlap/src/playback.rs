//! Point-in-time lookup into a precomputed comparison, with coaching cues.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{channel, Comparison, ResampledLap};

const BRAKING_PRESSURE: f64 = 5.0;
const FULL_THROTTLE_PCT: f64 = 90.0;
const SPEED_DEFICIT_KMH: f64 = 5.0;
const SECTOR_TOLERANCE_S: f64 = 0.1;

/// Instantaneous driving difference at the current playback position.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cue", rename_all = "snake_case")]
pub enum CoachingCue {
    /// Live driver is braking where the ghost is not.
    BrakingEarly,
    /// Ghost is braking where the live driver is not.
    MissedBraking,
    /// Ghost is flat out, live driver is not.
    LiftingThrottle,
    SpeedDeficit { kmh: f64 },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectorVerdict {
    Losing,
    Gaining,
    Matching,
}

impl SectorVerdict {
    pub fn from_delta(delta_s: f64) -> Self {
        if delta_s > SECTOR_TOLERANCE_S {
            SectorVerdict::Losing
        } else if delta_s < -SECTOR_TOLERANCE_S {
            SectorVerdict::Gaining
        } else {
            SectorVerdict::Matching
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaybackFrame {
    pub time_s: f64,
    pub index: usize,
    pub ghost: BTreeMap<String, f64>,
    pub live: BTreeMap<String, f64>,
    pub cumulative_delta: Option<f64>,
    /// Ghost lap time plus the current cumulative delta.
    pub projected_lap_time: Option<f64>,
    pub sector: Option<String>,
    pub sector_delta: Option<f64>,
    pub verdict: Option<SectorVerdict>,
    pub cue: Option<CoachingCue>,
}

pub(crate) fn frame_at(comparison: &Comparison, time_s: f64) -> Option<PlaybackFrame> {
    let aligned = &comparison.aligned;
    let report = &comparison.report;
    let index = aligned.index_at(time_s)?;

    let ghost = row(&aligned.ghost, index);
    let live = row(&aligned.live, index);
    let cumulative_delta = report
        .cumulative_delta
        .as_ref()
        .and_then(|c| c.get(index).copied());
    let sector = report.sector_at(index).map(|s| s.to_string());
    let sector_delta = sector.as_ref().and_then(|name| {
        report
            .sectors
            .as_ref()?
            .iter()
            .find(|s| &s.name == name)
            .map(|s| s.delta)
    });

    Some(PlaybackFrame {
        time_s: aligned.times[index],
        index,
        cue: coaching_cue(&ghost, &live),
        ghost,
        live,
        cumulative_delta,
        projected_lap_time: cumulative_delta.map(|d| comparison.ghost.duration() + d),
        sector,
        sector_delta,
        verdict: sector_delta.map(SectorVerdict::from_delta),
    })
}

fn row(lap: &ResampledLap, index: usize) -> BTreeMap<String, f64> {
    lap.channels
        .keys()
        .map(|name| (name.clone(), lap.value_at(name, index)))
        .collect()
}

/// First matching rule wins; missing readings never trigger a cue.
pub fn coaching_cue(ghost: &BTreeMap<String, f64>, live: &BTreeMap<String, f64>) -> Option<CoachingCue> {
    let value = |m: &BTreeMap<String, f64>, name: &str| m.get(name).copied().unwrap_or(f64::NAN);

    let live_brake = value(live, channel::BRAKE_FRONT) > BRAKING_PRESSURE;
    let ghost_brake = value(ghost, channel::BRAKE_FRONT) > BRAKING_PRESSURE;
    if live_brake && !ghost_brake {
        return Some(CoachingCue::BrakingEarly);
    }
    if ghost_brake && !live_brake {
        return Some(CoachingCue::MissedBraking);
    }
    if value(live, channel::THROTTLE) < FULL_THROTTLE_PCT
        && value(ghost, channel::THROTTLE) > FULL_THROTTLE_PCT
    {
        return Some(CoachingCue::LiftingThrottle);
    }
    let (ghost_speed, live_speed) = (value(ghost, channel::SPEED), value(live, channel::SPEED));
    if live_speed < ghost_speed - SPEED_DEFICIT_KMH {
        return Some(CoachingCue::SpeedDeficit {
            kmh: ghost_speed - live_speed,
        });
    }
    None
}
