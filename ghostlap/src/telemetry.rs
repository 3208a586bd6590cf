//! Long-format telemetry ingestion and normalization into a wide, time-indexed frame.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{channel, LapError, Params};

const TIMESTAMP_COLUMN: &str = "timestamp";
const NAME_COLUMN: &str = "telemetry_name";
const VALUE_COLUMN: &str = "telemetry_value";

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// One raw `(timestamp, channel, value)` reading. Values that failed numeric
/// coercion are NaN.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: String,
    pub channel: String,
    pub value: f64,
}

impl TelemetrySample {
    pub fn new(timestamp: impl Into<String>, channel: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Wide telemetry table: one row per distinct timestamp, one column per channel.
///
/// `times` is non-decreasing and every column has `times.len()` entries.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryFrame {
    pub times: Vec<f64>,
    #[serde(with = "nan_as_null")]
    pub channels: BTreeMap<String, Vec<f64>>,
}

impl TelemetryFrame {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(|c| c.as_slice())
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|k| k.as_str())
    }

    /// Rows with `start <= t < end`.
    pub fn slice_time(&self, start: f64, end: f64) -> TelemetryFrame {
        let mask: Vec<bool> = self.times.iter().map(|&t| t >= start && t < end).collect();
        self.select_rows(&mask)
    }

    /// Shift every timestamp by `-origin`.
    pub fn rebase(mut self, origin: f64) -> TelemetryFrame {
        for t in &mut self.times {
            *t -= origin;
        }
        self
    }

    fn select_rows(&self, mask: &[bool]) -> TelemetryFrame {
        TelemetryFrame {
            times: pick_rows(&self.times, mask),
            channels: self
                .channels
                .iter()
                .map(|(name, column)| (name.clone(), pick_rows(column, mask)))
                .collect(),
        }
    }
}

fn pick_rows(column: &[f64], mask: &[bool]) -> Vec<f64> {
    column
        .iter()
        .zip(mask)
        .filter_map(|(v, &keep)| keep.then_some(*v))
        .collect()
}

/// Read long-format CSV telemetry. Only the `timestamp`, `telemetry_name` and
/// `telemetry_value` columns are consulted.
pub fn read_samples<R: Read>(input: R) -> Result<Vec<TelemetrySample>, LapError> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.byte_headers()?.clone();
    let column = |name: &str| -> Result<usize, LapError> {
        headers
            .iter()
            .position(|h| String::from_utf8_lossy(h).trim() == name)
            .ok_or_else(|| LapError::Data(format!("required column '{}' not found", name)))
    };
    let ts_idx = column(TIMESTAMP_COLUMN)?;
    let name_idx = column(NAME_COLUMN)?;
    let value_idx = column(VALUE_COLUMN)?;

    let mut samples = Vec::new();
    // invalid UTF-8 decodes lossily; a garbled timestamp is dropped later
    for row in reader.byte_records() {
        let row = row?;
        let field = |idx: usize| {
            String::from_utf8_lossy(row.get(idx).unwrap_or_default())
                .trim()
                .to_string()
        };
        samples.push(TelemetrySample {
            timestamp: field(ts_idx),
            channel: field(name_idx),
            value: field(value_idx).parse::<f64>().unwrap_or(f64::NAN),
        });
    }
    if samples.is_empty() {
        return Err(LapError::Data("telemetry input has no rows".into()));
    }
    Ok(samples)
}

/// Parse a timestamp into seconds since the Unix epoch.
///
/// Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS[.f]` (read as UTC) and bare
/// numeric seconds. Anything else yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_micros() as f64 / 1e6);
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.timestamp_micros() as f64 / 1e6);
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp_micros() as f64 / 1e6);
        }
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Pivot raw samples into a [`TelemetryFrame`].
///
/// Duplicate `(timestamp, channel)` readings are averaged, rows are sorted by
/// parsed time, numeric channels are forward-filled independently and rows
/// still lacking a lap distance are dropped.
pub fn normalize(samples: &[TelemetrySample], params: &Params) -> Result<TelemetryFrame, LapError> {
    if samples.is_empty() {
        return Err(LapError::Data("no telemetry samples".into()));
    }

    let mut grouped: BTreeMap<&str, BTreeMap<&str, (f64, usize)>> = BTreeMap::new();
    let mut observed: BTreeSet<&str> = BTreeSet::new();
    for sample in samples {
        observed.insert(sample.channel.as_str());
        let cell = grouped
            .entry(sample.timestamp.as_str())
            .or_default()
            .entry(sample.channel.as_str())
            .or_insert((0.0, 0));
        if sample.value.is_finite() {
            cell.0 += sample.value;
            cell.1 += 1;
        }
    }

    let mut rows: Vec<(f64, &BTreeMap<&str, (f64, usize)>)> = grouped
        .iter()
        .filter_map(|(raw, cells)| parse_timestamp(raw).map(|t| (t, cells)))
        .collect();
    if rows.is_empty() {
        return Err(LapError::Data(format!(
            "none of {} timestamps could be parsed",
            grouped.len()
        )));
    }
    let unparseable = grouped.len() - rows.len();
    if unparseable > 0 {
        warn!(unparseable, "dropping rows with malformed timestamps");
    }
    rows.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut names: BTreeSet<String> = observed.iter().map(|s| s.to_string()).collect();
    names.extend(params.numeric_channels.iter().cloned());

    let mut channels = BTreeMap::new();
    for name in names {
        let mut column: Vec<f64> = rows
            .iter()
            .map(|(_, cells)| match cells.get(name.as_str()) {
                Some(&(sum, count)) if count > 0 => sum / count as f64,
                _ => f64::NAN,
            })
            .collect();
        if params.numeric_channels.iter().any(|c| *c == name) {
            forward_fill(&mut column);
        }
        channels.insert(name, column);
    }

    let frame = TelemetryFrame {
        times: rows.iter().map(|(t, _)| *t).collect(),
        channels,
    };

    let distance = frame.channel(channel::DISTANCE).ok_or_else(|| {
        LapError::Data(format!("required channel '{}' not present", channel::DISTANCE))
    })?;
    let mask: Vec<bool> = distance.iter().map(|d| !d.is_nan()).collect();
    if !mask.iter().any(|&keep| keep) {
        return Err(LapError::Data(format!(
            "required channel '{}' has no readings",
            channel::DISTANCE
        )));
    }
    let frame = frame.select_rows(&mask);
    debug!(
        rows = frame.len(),
        channels = frame.channels.len(),
        "normalized telemetry frame"
    );
    Ok(frame)
}

/// Carry the last non-NaN value forward over NaN gaps.
pub(crate) fn forward_fill(values: &mut [f64]) {
    let mut last = f64::NAN;
    for v in values.iter_mut() {
        if v.is_nan() {
            *v = last;
        } else {
            last = *v;
        }
    }
}

/// Fill leading NaNs with the first non-NaN value.
pub(crate) fn backward_fill(values: &mut [f64]) {
    let mut next = f64::NAN;
    for v in values.iter_mut().rev() {
        if v.is_nan() {
            *v = next;
        } else {
            next = *v;
        }
    }
}

mod nan_as_null {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        channels: &BTreeMap<String, Vec<f64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let view: BTreeMap<&str, Vec<Option<f64>>> = channels
            .iter()
            .map(|(name, column)| {
                let column = column
                    .iter()
                    .map(|v| v.is_finite().then_some(*v))
                    .collect();
                (name.as_str(), column)
            })
            .collect();
        view.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<f64>>, D::Error> {
        let view = BTreeMap::<String, Vec<Option<f64>>>::deserialize(deserializer)?;
        Ok(view
            .into_iter()
            .map(|(name, column)| {
                let column = column.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                (name, column)
            })
            .collect())
    }
}
