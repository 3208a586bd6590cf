//! Lap segmentation and ghost-lap alignment for sparsely sampled racing telemetry.
//!
//! The pipeline is batch and single-threaded: raw samples are normalized into a
//! wide [`TelemetryFrame`], segmented into [`LapInterval`]s, reference laps are
//! selected and sliced into [`LapRecord`]s, two records are resampled onto a
//! shared grid ([`AlignedPair`]) and compared by the delta engine.

use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod cache;
pub mod delta;
pub mod features;
pub mod playback;
pub mod resample;
pub mod segment;
pub mod select;
pub mod stats;
pub mod telemetry;

pub use cache::{SessionCache, SessionKey};
pub use delta::{
    compute_delta, speed_delta_step, AlignmentGap, DeltaReport, LapSide, Sector, SectorMap,
    SectorSplit,
};
pub use features::{extract_features, LapFeatures, FEATURE_NAMES};
pub use playback::{CoachingCue, PlaybackFrame, SectorVerdict};
pub use resample::{align, fixed_grid, resample_onto, AlignedPair, ResampledLap};
pub use segment::{find_crossings, segment_laps, LapInterval, Segmentation};
pub use select::{extract_lap, select_lap, LapRecord, SelectionPolicy};
pub use stats::{DistanceStats, SessionStats};
pub use telemetry::{normalize, parse_timestamp, read_samples, TelemetryFrame, TelemetrySample};

/// Channel identifiers emitted by the vehicle logger.
pub mod channel {
    pub const DISTANCE: &str = "Laptrigger_lapdist_dls";
    pub const SPEED: &str = "speed";
    pub const RPM: &str = "nmot";
    pub const THROTTLE: &str = "aps";
    pub const GEAR: &str = "gear";
    pub const STEERING: &str = "Steering_Angle";
    pub const BRAKE_FRONT: &str = "pbrake_f";
    pub const BRAKE_REAR: &str = "pbrake_r";
    pub const LATITUDE: &str = "VBOX_Lat_Min";
    pub const LONGITUDE: &str = "VBOX_Long_Minutes";
    pub const ACCEL_X: &str = "accx_can";
    pub const ACCEL_Y: &str = "accy_can";
}

#[derive(Error, Debug)]
pub enum LapError {
    #[error("telemetry data error: {0}")]
    Data(String),
    #[error("insufficient lap crossings: found {found}, need at least 2 (threshold {threshold})")]
    InsufficientData { found: usize, threshold: f64 },
    #[error("no valid laps longer than {min_lap_time}s among {candidates} candidates")]
    NoValidLap { min_lap_time: f64, candidates: usize },
    #[error("channel '{channel}' missing from {side} lap; {value} is undefined")]
    AlignmentGap {
        channel: String,
        side: LapSide,
        value: &'static str,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to read telemetry CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Params {
    /// Distance drop (negative) that marks a start/finish crossing.
    pub lap_reset_threshold: f64,
    /// Candidate laps must be strictly longer than this many seconds.
    pub min_lap_time: f64,
    /// Fixed step of the comparison grid, in seconds.
    pub resample_step: f64,
    /// Channels coerced to numbers and forward-filled during normalization.
    pub numeric_channels: Vec<String>,
    /// Channels carried onto the comparison grid.
    pub aligned_channels: Vec<String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            lap_reset_threshold: -3000.0,
            min_lap_time: 60.0,
            resample_step: 0.01,
            numeric_channels: [
                channel::DISTANCE,
                channel::STEERING,
                channel::LATITUDE,
                channel::LONGITUDE,
                channel::ACCEL_X,
                channel::ACCEL_Y,
                channel::THROTTLE,
                channel::GEAR,
                channel::RPM,
                channel::BRAKE_FRONT,
                channel::BRAKE_REAR,
                channel::SPEED,
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            aligned_channels: [
                channel::SPEED,
                channel::RPM,
                channel::THROTTLE,
                channel::GEAR,
                channel::STEERING,
                channel::BRAKE_FRONT,
                channel::BRAKE_REAR,
                channel::LATITUDE,
                channel::LONGITUDE,
                channel::DISTANCE,
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), LapError> {
        if !self.lap_reset_threshold.is_finite() || self.lap_reset_threshold >= 0.0 {
            return Err(LapError::InvalidParameter(format!(
                "lap_reset_threshold must be a negative distance drop, got {}",
                self.lap_reset_threshold
            )));
        }
        if !self.min_lap_time.is_finite() || self.min_lap_time < 0.0 {
            return Err(LapError::InvalidParameter(format!(
                "min_lap_time must be >= 0, got {}",
                self.min_lap_time
            )));
        }
        if !self.resample_step.is_finite() || self.resample_step <= 0.0 {
            return Err(LapError::InvalidParameter(format!(
                "resample_step must be > 0, got {}",
                self.resample_step
            )));
        }
        Ok(())
    }
}

/// Normalized telemetry plus its lap segmentation for one session file.
#[derive(Clone, Debug)]
pub struct Session {
    pub frame: TelemetryFrame,
    pub segmentation: Segmentation,
}

impl Session {
    /// Segment an already normalized frame.
    pub fn from_frame(frame: TelemetryFrame, params: &Params) -> Result<Self, LapError> {
        let segmentation = segment_laps(&frame, params)?;
        Ok(Self {
            frame,
            segmentation,
        })
    }

    pub fn laps(&self) -> &[LapInterval] {
        &self.segmentation.laps
    }

    pub fn lap_record(&self, policy: SelectionPolicy) -> Result<LapRecord, LapError> {
        let lap = select_lap(&self.segmentation.laps, policy)?;
        Ok(extract_lap(&self.frame, lap))
    }

    /// Feature vector of every valid lap, in lap order.
    pub fn lap_features(&self) -> Vec<(LapInterval, LapFeatures)> {
        self.segmentation
            .laps
            .iter()
            .map(|lap| (*lap, extract_features(&extract_lap(&self.frame, lap))))
            .collect()
    }

    pub fn stats(&self) -> Option<SessionStats> {
        SessionStats::from_laps(&self.segmentation.laps)
    }
}

/// Read, normalize and segment one session's CSV telemetry.
pub fn analyze_session<R: Read>(input: R, params: &Params) -> Result<Session, LapError> {
    params.validate()?;
    let samples = read_samples(input)?;
    debug!(samples = samples.len(), "read telemetry samples");
    let frame = normalize(&samples, params)?;
    Session::from_frame(frame, params)
}

/// Result of comparing a live lap against its ghost.
#[derive(Clone, Debug)]
pub struct Comparison {
    pub ghost: LapRecord,
    pub live: LapRecord,
    pub aligned: AlignedPair,
    pub report: DeltaReport,
}

/// Align two lap records and run the delta engine over the shared grid.
///
/// The returned records carry their per-sector occupancy times when the
/// sector split is defined.
pub fn compare_laps(
    ghost: LapRecord,
    live: LapRecord,
    sectors: &SectorMap,
    params: &Params,
) -> Result<Comparison, LapError> {
    params.validate()?;
    let aligned = align(&ghost, &live, params.resample_step, &params.aligned_channels)?;
    let report = compute_delta(&aligned, sectors);
    for gap in &report.gaps {
        debug!(channel = %gap.channel, side = %gap.side, "alignment gap");
    }

    let (ghost, live) = match report.sectors.as_ref() {
        Some(splits) => (
            ghost.with_sector_times(splits.iter().map(|s| (s.name.clone(), s.ghost_time)).collect()),
            live.with_sector_times(splits.iter().map(|s| (s.name.clone(), s.live_time)).collect()),
        ),
        None => (ghost, live),
    };

    Ok(Comparison {
        ghost,
        live,
        aligned,
        report,
    })
}

impl Comparison {
    /// Nearest precomputed grid row for a playback position.
    pub fn frame_at(&self, time_s: f64) -> Option<PlaybackFrame> {
        playback::frame_at(self, time_s)
    }
}
