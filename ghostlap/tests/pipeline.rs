use ghostlap::{
    analyze_session, channel, compare_laps, extract_features, speed_delta_step, LapError, Params,
    SectorMap, SelectionPolicy,
};

const LAP_LENGTH_M: f64 = 3690.0;
const RESETS: [f64; 7] = [5.0, 75.0, 149.0, 239.0, 279.0, 351.0, 427.0];
const END: f64 = 440.0;

fn lap_speed_kmh(duration: f64) -> f64 {
    LAP_LENGTH_M / duration * 3.6
}

fn timestamp(t: f64) -> String {
    let total = 18.0 * 3600.0 + t;
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;
    format!("2025-04-05 {:02}:{:02}:{:06.3}", hours, minutes, seconds)
}

/// Long-format session: distance and speed every 0.5 s, pedals and rpm every
/// second, one duplicated speed reading and one garbled timestamp.
fn session_csv(resets: &[f64], end: f64) -> String {
    let mut out = String::from("vehicle_id,timestamp,telemetry_name,telemetry_value\n");
    let mut push = |t: &str, name: &str, value: f64| {
        out.push_str(&format!("GR86-002,{},{},{}\n", t, name, value));
    };

    let mut t = 0.0;
    while t <= end {
        let ts = timestamp(t);
        let (distance, speed) = match resets.iter().rposition(|&r| r <= t) {
            None => (3900.0, 150.0),
            Some(k) => {
                let next = resets.get(k + 1).copied().unwrap_or(end + 1.0);
                let duration = next - resets[k];
                (LAP_LENGTH_M * (t - resets[k]) / duration, lap_speed_kmh(duration))
            }
        };
        push(&ts, channel::DISTANCE, distance);
        if t == 100.0 {
            push(&ts, channel::SPEED, speed + 1.0);
            push(&ts, channel::SPEED, speed - 1.0);
        } else {
            push(&ts, channel::SPEED, speed);
        }
        if t.fract() == 0.0 {
            let fraction = distance / LAP_LENGTH_M;
            let braking = (0.30..0.35).contains(&fraction);
            push(&ts, channel::BRAKE_FRONT, if braking { 40.0 } else { 0.0 });
            push(&ts, channel::THROTTLE, if braking { 0.0 } else { 100.0 });
            push(&ts, channel::RPM, 6000.0);
        }
        t += 0.5;
    }
    out.push_str("GR86-002,not-a-time,speed,999\n");
    out
}

fn barber() -> SectorMap {
    SectorMap::from_json_str(
        r#"{"bins": [4, 1216, 1608, 1943, 3699],
            "labels": ["Sector 1", "Sector 2", "Sector 3", "Sector 4"]}"#,
    )
    .unwrap()
}

#[test]
fn segments_session_and_summarises_laps() {
    let csv = session_csv(&RESETS, END);
    let session = analyze_session(csv.as_bytes(), &Params::default()).unwrap();

    assert_eq!(session.segmentation.crossings.len(), RESETS.len());
    assert_eq!(session.segmentation.candidates.len(), 6);
    let durations: Vec<f64> = session.laps().iter().map(|l| l.duration).collect();
    assert_eq!(durations, vec![70.0, 74.0, 90.0, 72.0, 76.0]);
    // the 40 s candidate is rejected and keeps its slot in the index space
    let indices: Vec<usize> = session.laps().iter().map(|l| l.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 4, 5]);

    let stats = session.stats().unwrap();
    assert_eq!(stats.lap_count, 5);
    assert_eq!((stats.fastest_lap, stats.fastest_time), (1, 70.0));
    assert_eq!((stats.slowest_lap, stats.slowest_time), (3, 90.0));
    assert!((stats.mean_time - 76.4).abs() < 1e-9);
}

#[test]
fn selects_and_extracts_reference_laps() {
    let csv = session_csv(&RESETS, END);
    let session = analyze_session(csv.as_bytes(), &Params::default()).unwrap();

    let ghost = session.lap_record(SelectionPolicy::Fastest).unwrap();
    assert_eq!(ghost.duration(), 70.0);
    assert_eq!(ghost.frame.times[0], 0.0);
    assert!(ghost.frame.times.iter().all(|&t| (0.0..70.0).contains(&t)));
    assert_eq!(ghost.frame.len(), 140);

    let live = session.lap_record(SelectionPolicy::Representative).unwrap();
    assert_eq!(live.duration(), 74.0);
    assert_eq!(live.lap.index, 1);

    // pedal channels are forward-filled onto the half-second rows
    let throttle = ghost.frame.channel(channel::THROTTLE).unwrap();
    assert!(throttle.iter().all(|v| v.is_finite()));
}

#[test]
fn compares_ghost_and_live_laps() {
    let csv = session_csv(&RESETS, END);
    let params = Params::default();
    let session = analyze_session(csv.as_bytes(), &params).unwrap();
    let ghost = session.lap_record(SelectionPolicy::Fastest).unwrap();
    let live = session.lap_record(SelectionPolicy::Representative).unwrap();

    let comparison = compare_laps(ghost, live, &barber(), &params).unwrap();
    assert_eq!(comparison.aligned.len(), 7400);
    assert!(comparison.report.gaps.is_empty());

    let final_delta = comparison.report.final_delta().unwrap();
    let per_step = speed_delta_step(lap_speed_kmh(70.0), lap_speed_kmh(74.0), 0.01);
    assert!((final_delta - per_step * 7400.0).abs() < 1e-6);

    let splits = comparison.report.sector_splits().unwrap();
    assert_eq!(splits.len(), 4);
    let contributed: f64 = splits.iter().map(|s| s.contribution.unwrap()).sum();
    assert!((contributed - final_delta).abs() < 1e-9);
    let occupied: f64 = splits.iter().map(|s| s.live_time).sum();
    assert!((occupied - 74.0).abs() < 1e-6);

    let sector_times = comparison.live.sector_times.as_ref().unwrap();
    assert_eq!(sector_times.len(), 4);
    assert_eq!(sector_times[0].0, "Sector 1");

    let frame = comparison.frame_at(30.0).unwrap();
    assert_eq!(frame.index, 3000);
    assert_eq!(frame.sector.as_deref(), Some("Sector 2"));
    let projected = frame.projected_lap_time.unwrap();
    assert!((projected - (70.0 + frame.cumulative_delta.unwrap())).abs() < 1e-12);
}

#[test]
fn features_describe_the_ghost_lap() {
    let csv = session_csv(&RESETS, END);
    let session = analyze_session(csv.as_bytes(), &Params::default()).unwrap();
    let ghost = session.lap_record(SelectionPolicy::Fastest).unwrap();

    let features = extract_features(&ghost);
    assert!((features.avg_speed - lap_speed_kmh(70.0)).abs() < 1e-6);
    assert_eq!(features.max_rpm, 6000.0);
    assert!(features.percent_braking > 0.0 && features.percent_braking < 10.0);
    assert!(
        (features.percent_full_throttle + features.percent_braking - 100.0).abs() < 1e-9
    );
    assert!(features.avg_steering_angle.is_nan());
}

#[test]
fn feature_matrix_covers_every_valid_lap() {
    let csv = session_csv(&RESETS, END);
    let session = analyze_session(csv.as_bytes(), &Params::default()).unwrap();

    let rows = session.lap_features();
    assert_eq!(rows.len(), session.laps().len());
    for ((lap, features), expected) in rows.iter().zip(session.laps()) {
        assert_eq!(lap, expected);
        assert!((features.avg_speed - lap_speed_kmh(lap.duration)).abs() < 0.05);
    }
    let durations: Vec<f64> = rows.iter().map(|(lap, _)| lap.duration).collect();
    assert_eq!(durations, vec![70.0, 74.0, 90.0, 72.0, 76.0]);
}

#[test]
fn one_crossing_is_insufficient() {
    let csv = session_csv(&[5.0], 80.0);
    let err = analyze_session(csv.as_bytes(), &Params::default()).unwrap_err();
    assert!(matches!(err, LapError::InsufficientData { found: 1, .. }));
}

#[test]
fn short_laps_only_is_no_valid_lap() {
    let csv = session_csv(&[5.0, 45.0, 90.0], 100.0);
    let err = analyze_session(csv.as_bytes(), &Params::default()).unwrap_err();
    assert!(matches!(
        err,
        LapError::NoValidLap { candidates: 2, .. }
    ));
}
