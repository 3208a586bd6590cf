//! Delta engine: cumulative time delta and per-sector gain/loss between two aligned laps.

use std::fmt;

use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

use super::{channel, AlignedPair, DistanceStats, LapError, ResampledLap};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LapSide {
    Ghost,
    Live,
}

impl fmt::Display for LapSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LapSide::Ghost => write!(f, "ghost"),
            LapSide::Live => write!(f, "live"),
        }
    }
}

/// A channel one side never recorded, leaving a derived value undefined.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlignmentGap {
    pub channel: String,
    pub side: LapSide,
}

/// Named distance range `(lower, upper]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sector {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
}

impl Sector {
    pub fn contains(&self, distance: f64) -> bool {
        distance > self.lower && distance <= self.upper
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SectorConfig {
    List(Vec<Sector>),
    Bins { bins: Vec<f64>, labels: Vec<String> },
}

/// Ordered, non-overlapping sector table for one circuit.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SectorMap {
    sectors: Vec<Sector>,
}

impl SectorMap {
    pub fn new(sectors: Vec<Sector>) -> Result<Self, LapError> {
        if sectors.is_empty() {
            return Err(LapError::InvalidParameter("sector map is empty".into()));
        }
        for sector in &sectors {
            if !(sector.lower.is_finite() && sector.upper.is_finite()) || sector.lower >= sector.upper
            {
                return Err(LapError::InvalidParameter(format!(
                    "sector '{}' has invalid range ({}, {}]",
                    sector.name, sector.lower, sector.upper
                )));
            }
        }
        for pair in sectors.windows(2) {
            if pair[1].lower < pair[0].upper {
                return Err(LapError::InvalidParameter(format!(
                    "sector '{}' overlaps or precedes '{}'",
                    pair[1].name, pair[0].name
                )));
            }
        }
        Ok(Self { sectors })
    }

    /// `bins` holds `labels.len() + 1` ascending boundaries.
    pub fn from_bins(bins: &[f64], labels: &[String]) -> Result<Self, LapError> {
        if bins.len() != labels.len() + 1 {
            return Err(LapError::InvalidParameter(format!(
                "{} bin edges cannot bound {} sectors",
                bins.len(),
                labels.len()
            )));
        }
        let sectors = bins
            .windows(2)
            .zip(labels)
            .map(|(edge, name)| Sector {
                name: name.clone(),
                lower: edge[0],
                upper: edge[1],
            })
            .collect();
        Self::new(sectors)
    }

    /// Accepts either a list of sectors or `{"bins": [...], "labels": [...]}`.
    pub fn from_json_str(text: &str) -> Result<Self, LapError> {
        let config: SectorConfig = serde_json::from_str(text)
            .map_err(|e| LapError::InvalidParameter(format!("sector config: {}", e)))?;
        match config {
            SectorConfig::List(sectors) => Self::new(sectors),
            SectorConfig::Bins { bins, labels } => Self::from_bins(&bins, &labels),
        }
    }

    /// Four sectors split at the quartiles of a reference lap's distance.
    pub fn quartiles(stats: &DistanceStats) -> Result<Self, LapError> {
        let bins = [stats.min, stats.q25, stats.median, stats.q75, stats.max];
        let labels: Vec<String> = (1..=4).map(|i| format!("Sector {}", i)).collect();
        Self::from_bins(&bins, &labels)
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sector> {
        self.sectors.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Sector> {
        self.sectors.get(idx)
    }

    pub fn locate(&self, distance: f64) -> Option<usize> {
        if distance.is_nan() {
            return None;
        }
        self.sectors.iter().position(|s| s.contains(distance))
    }
}

/// Per-sector comparison row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectorSplit {
    pub name: String,
    /// Grid rows the ghost spent in the sector times the step.
    pub ghost_time: f64,
    pub live_time: f64,
    /// `live_time - ghost_time`.
    pub delta: f64,
    /// Sum of the per-step delta over rows the live lap spent in the sector.
    /// These sum to the final cumulative delta. `None` without speed data.
    pub contribution: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct DeltaReport {
    pub step: f64,
    pub speed_delta: Option<Array1<f64>>,
    /// Seconds lost (positive) or gained (negative) by the live lap up to each row.
    pub cumulative_delta: Option<Array1<f64>>,
    /// Live-lap sector index per grid row.
    pub sector_labels: Option<Vec<usize>>,
    pub sector_names: Vec<String>,
    pub sectors: Option<Vec<SectorSplit>>,
    pub gaps: Vec<AlignmentGap>,
}

impl DeltaReport {
    pub fn final_delta(&self) -> Result<f64, LapError> {
        self.cumulative_delta
            .as_ref()
            .and_then(|c| c.last().copied())
            .ok_or_else(|| self.gap_error(channel::SPEED, "cumulative delta"))
    }

    pub fn sector_splits(&self) -> Result<&[SectorSplit], LapError> {
        self.sectors
            .as_deref()
            .ok_or_else(|| self.gap_error(channel::DISTANCE, "sector split"))
    }

    pub fn sector_at(&self, idx: usize) -> Option<&str> {
        let label = *self.sector_labels.as_ref()?.get(idx)?;
        self.sector_names.get(label).map(|s| s.as_str())
    }

    fn gap_error(&self, channel: &str, value: &'static str) -> LapError {
        let side = self
            .gaps
            .iter()
            .find(|g| g.channel == channel)
            .map(|g| g.side)
            .unwrap_or(LapSide::Live);
        LapError::AlignmentGap {
            channel: channel.to_string(),
            side,
            value,
        }
    }
}

/// Time cost of one grid step at a speed differential.
///
/// `(live_kmh - ghost_kmh) / 3600 * step_s`. Heuristic: the speed difference
/// is integrated as if it were a time cost, which does not follow from
/// kinematics. Swap this function out rather than patching callers if a real
/// timing model becomes available.
pub fn speed_delta_step(ghost_kmh: f64, live_kmh: f64, step_s: f64) -> f64 {
    (live_kmh - ghost_kmh) / 3600.0 * step_s
}

/// Run the delta engine over an aligned pair.
pub fn compute_delta(aligned: &AlignedPair, sectors: &SectorMap) -> DeltaReport {
    let mut gaps = Vec::new();
    let step = aligned.step;

    let ghost_speed = require(&aligned.ghost, LapSide::Ghost, channel::SPEED, &mut gaps);
    let live_speed = require(&aligned.live, LapSide::Live, channel::SPEED, &mut gaps);
    let speed_delta = match (ghost_speed, live_speed) {
        (Some(ghost), Some(live)) => Some(
            Zip::from(ghost)
                .and(live)
                .map_collect(|&g, &l| speed_delta_step(g, l, step)),
        ),
        _ => None,
    };
    let cumulative_delta = speed_delta.as_ref().map(|delta| {
        delta
            .iter()
            .scan(0.0, |total, &d| {
                *total += d;
                Some(*total)
            })
            .collect::<Array1<f64>>()
    });

    let ghost_labels = require(&aligned.ghost, LapSide::Ghost, channel::DISTANCE, &mut gaps)
        .and_then(|d| assign_sectors(d, sectors));
    let live_labels = require(&aligned.live, LapSide::Live, channel::DISTANCE, &mut gaps)
        .and_then(|d| assign_sectors(d, sectors));

    let splits = match (&ghost_labels, &live_labels) {
        (Some(ghost), Some(live)) => Some(
            sectors
                .iter()
                .enumerate()
                .map(|(i, sector)| {
                    let ghost_time = ghost.iter().filter(|&&l| l == i).count() as f64 * step;
                    let live_time = live.iter().filter(|&&l| l == i).count() as f64 * step;
                    let contribution = speed_delta.as_ref().map(|delta| {
                        delta
                            .iter()
                            .zip(live)
                            .filter(|&(_, &l)| l == i)
                            .map(|(d, _)| *d)
                            .sum::<f64>()
                    });
                    SectorSplit {
                        name: sector.name.clone(),
                        ghost_time,
                        live_time,
                        delta: live_time - ghost_time,
                        contribution,
                    }
                })
                .collect(),
        ),
        (ghost, live) => {
            for (labels, side) in [(ghost, LapSide::Ghost), (live, LapSide::Live)] {
                let flagged = gaps
                    .iter()
                    .any(|g| g.side == side && g.channel == channel::DISTANCE);
                if labels.is_none() && !flagged {
                    // distance recorded but never inside a declared sector
                    gaps.push(AlignmentGap {
                        channel: channel::DISTANCE.to_string(),
                        side,
                    });
                }
            }
            None
        }
    };

    DeltaReport {
        step,
        speed_delta,
        cumulative_delta,
        sector_labels: live_labels,
        sector_names: sectors.iter().map(|s| s.name.clone()).collect(),
        sectors: splits,
        gaps,
    }
}

fn require<'a>(
    lap: &'a ResampledLap,
    side: LapSide,
    name: &str,
    gaps: &mut Vec<AlignmentGap>,
) -> Option<&'a Array1<f64>> {
    if lap.has_data(name) {
        lap.channel(name)
    } else {
        gaps.push(AlignmentGap {
            channel: name.to_string(),
            side,
        });
        None
    }
}

/// Sector index per row; rows outside every sector take the nearest labelled
/// neighbour (forward, then backward). `None` when no row falls in a sector.
fn assign_sectors(distance: &Array1<f64>, sectors: &SectorMap) -> Option<Vec<usize>> {
    let mut labels: Vec<Option<usize>> = distance.iter().map(|&d| sectors.locate(d)).collect();
    let mut last = None;
    for label in labels.iter_mut() {
        match label {
            Some(l) => last = Some(*l),
            None => *label = last,
        }
    }
    let mut next = None;
    for label in labels.iter_mut().rev() {
        match label {
            Some(l) => next = Some(*l),
            None => *label = next,
        }
    }
    labels.into_iter().collect()
}
