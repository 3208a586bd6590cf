//! Fixed-order feature vector for the external lap-time regressor.

use serde::{Deserialize, Serialize};

use super::{channel, LapRecord};

const FULL_THROTTLE_PCT: f64 = 95.0;
const BRAKING_PRESSURE: f64 = 5.0;

/// Feature names in the order the regressor was fit with.
pub const FEATURE_NAMES: [&str; 8] = [
    "avg_speed",
    "max_speed",
    "avg_rpm",
    "max_rpm",
    "avg_throttle",
    "percent_full_throttle",
    "percent_braking",
    "avg_steering_angle",
];

/// Aggregate driving features of one lap. A feature whose input channel was
/// never recorded is NaN; substituting a value is the caller's decision.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapFeatures {
    pub avg_speed: f64,
    pub max_speed: f64,
    pub avg_rpm: f64,
    pub max_rpm: f64,
    pub avg_throttle: f64,
    pub percent_full_throttle: f64,
    pub percent_braking: f64,
    pub avg_steering_angle: f64,
}

impl LapFeatures {
    pub fn to_vector(&self) -> [f64; 8] {
        [
            self.avg_speed,
            self.max_speed,
            self.avg_rpm,
            self.max_rpm,
            self.avg_throttle,
            self.percent_full_throttle,
            self.percent_braking,
            self.avg_steering_angle,
        ]
    }

    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> {
        FEATURE_NAMES.into_iter().zip(self.to_vector())
    }
}

pub fn extract_features(record: &LapRecord) -> LapFeatures {
    let column = |name: &str| record.frame.channel(name).unwrap_or(&[]);
    let speed = column(channel::SPEED);
    let rpm = column(channel::RPM);
    let throttle = column(channel::THROTTLE);
    let brake = column(channel::BRAKE_FRONT);
    let steering = column(channel::STEERING);

    LapFeatures {
        avg_speed: mean(speed),
        max_speed: max(speed),
        avg_rpm: mean(rpm),
        max_rpm: max(rpm),
        avg_throttle: mean(throttle),
        percent_full_throttle: percent_above(throttle, FULL_THROTTLE_PCT),
        percent_braking: percent_above(brake, BRAKING_PRESSURE),
        avg_steering_angle: mean(&steering.iter().map(|v| v.abs()).collect::<Vec<_>>()),
    }
}

fn finite(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().filter(|v| v.is_finite())
}

fn mean(values: &[f64]) -> f64 {
    let (sum, count) = finite(values).fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn max(values: &[f64]) -> f64 {
    finite(values).fold(f64::NAN, f64::max)
}

/// Share of all rows (missing readings count as "not above") strictly above `threshold`.
fn percent_above(values: &[f64], threshold: f64) -> f64 {
    if finite(values).next().is_none() {
        return f64::NAN;
    }
    let above = values.iter().filter(|&&v| v > threshold).count();
    above as f64 / values.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LapInterval, TelemetryFrame};
    use std::collections::BTreeMap;

    fn record(columns: &[(&str, Vec<f64>)]) -> LapRecord {
        let len = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        let channels: BTreeMap<String, Vec<f64>> = columns
            .iter()
            .map(|(name, values)| (name.to_string(), values.clone()))
            .collect();
        LapRecord {
            lap: LapInterval {
                index: 0,
                start_time: 0.0,
                end_time: 70.0,
                duration: 70.0,
            },
            frame: TelemetryFrame {
                times: (0..len).map(|i| i as f64).collect(),
                channels,
            },
            sector_times: None,
        }
    }

    #[test]
    fn full_throttle_share() {
        let rec = record(&[(channel::THROTTLE, vec![100.0, 100.0, 50.0, 0.0])]);
        let features = extract_features(&rec);
        assert_eq!(features.percent_full_throttle, 50.0);
        assert_eq!(features.avg_throttle, 62.5);
    }

    #[test]
    fn aggregates_every_feature() {
        let rec = record(&[
            (channel::SPEED, vec![100.0, 200.0, f64::NAN, 150.0]),
            (channel::RPM, vec![5000.0, 7000.0, 6000.0, 6000.0]),
            (channel::THROTTLE, vec![96.0, 95.0, 20.0, 0.0]),
            (channel::BRAKE_FRONT, vec![0.0, 0.0, 40.0, f64::NAN]),
            (channel::STEERING, vec![-10.0, 10.0, 20.0, -20.0]),
        ]);
        let f = extract_features(&rec);
        assert_eq!(f.avg_speed, 150.0);
        assert_eq!(f.max_speed, 200.0);
        assert_eq!(f.avg_rpm, 6000.0);
        assert_eq!(f.max_rpm, 7000.0);
        assert_eq!(f.percent_full_throttle, 25.0);
        assert_eq!(f.percent_braking, 25.0);
        assert_eq!(f.avg_steering_angle, 15.0);
    }

    #[test]
    fn missing_channels_yield_nan() {
        let rec = record(&[(channel::SPEED, vec![120.0, 130.0])]);
        let f = extract_features(&rec);
        assert_eq!(f.avg_speed, 125.0);
        assert!(f.avg_rpm.is_nan());
        assert!(f.max_rpm.is_nan());
        assert!(f.percent_braking.is_nan());
        assert!(f.avg_steering_angle.is_nan());
    }

    #[test]
    fn vector_follows_feature_names() {
        let rec = record(&[(channel::SPEED, vec![120.0, 140.0])]);
        let f = extract_features(&rec);
        let named: Vec<_> = f.named().collect();
        assert_eq!(named.len(), FEATURE_NAMES.len());
        assert_eq!(named[0], ("avg_speed", 130.0));
        assert_eq!(named[1], ("max_speed", 140.0));
    }
}
