//! End-to-end scenarios over the public API: batch import, live processing and
//! crash recovery of a recording session.

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

use ski_telemetry::analytics;
use ski_telemetry::kinematics::Kinematics;
use ski_telemetry::pipeline::analyze_samples;
use ski_telemetry::schema::LocationFix;
use ski_telemetry::session::{GrantedAuthority, RecordingSession, SampleOutcome};
use ski_telemetry::{
    gpx_to_track, EngineConfig, FileCheckpointStore, MemoryCheckpointStore, RawSample,
    SessionState, SourceFormat, TrackProcessor,
};

const METERS_PER_DEGREE: f64 = 111_195.0;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap()
}

/// 1 Hz samples heading north; each leg is (seconds, horizontal m/s, vertical m/s)
fn track_from_legs(legs: &[(u32, f64, f64)]) -> Vec<RawSample> {
    let mut samples = Vec::new();
    let mut north = 0.0;
    let mut elevation = 2500.0;
    let mut t = 0;

    let mut push = |north: f64, elevation: f64, t: i64| {
        let mut s = RawSample::new(46.0 + north / METERS_PER_DEGREE, 7.0, t0() + Duration::seconds(t));
        s.elevation = Some(elevation);
        samples.push(s);
    };

    push(north, elevation, t);
    for &(secs, horizontal, vertical) in legs {
        for _ in 0..secs {
            north += horizontal;
            elevation += vertical;
            t += 1;
            push(north, elevation, t);
        }
    }
    samples
}

/// 100 points at 1 s spacing losing 500 m over 600 m
fn steady_descent() -> Vec<RawSample> {
    (0..100)
        .map(|i| {
            let f = i as f64 / 99.0;
            let mut s = RawSample::new(
                46.0 + 600.0 * f / METERS_PER_DEGREE,
                7.0,
                t0() + Duration::seconds(i),
            );
            s.elevation = Some(2500.0 - 500.0 * f);
            s
        })
        .collect()
}

fn to_fix(sample: &RawSample) -> LocationFix {
    let mut fix = LocationFix::new(sample.timestamp, sample.latitude, sample.longitude);
    fix.elevation = sample.elevation;
    fix.accuracy = Some(4.0);
    fix
}

#[test]
fn test_speed_is_distance_over_time() {
    let a = RawSample::new(46.0, 7.0, t0());
    let b = RawSample::new(46.0 + 10.0 / METERS_PER_DEGREE, 7.0, t0() + Duration::seconds(2));
    let points = Kinematics::annotate_all(EngineConfig::default().kinematics, &[a, b]);

    assert!((points[1].distance - 10.0).abs() < 0.01);
    assert!((points[1].elapsed - 2.0).abs() < 1e-9);
    assert!((points[1].speed - 5.0).abs() < 0.01);
}

#[test]
fn test_steady_descent_is_one_run() {
    let track = analyze_samples(
        &steady_descent(),
        "Descent".to_string(),
        SourceFormat::Gpx,
        &EngineConfig::default(),
    );

    assert_eq!(track.runs.len(), 1);
    let run = &track.runs[0];
    assert_eq!((run.start_index, run.end_index), (0, 99));
    assert!((run.vertical_drop - 500.0).abs() < 1e-6);
    assert!((run.distance - 600.0).abs() < 0.5);
    assert!((track.stats.ski_vertical - 500.0).abs() < 1e-6);
    assert!(track.runs_are_consistent());
}

#[test]
fn test_position_glitch_does_not_fragment_or_inflate() {
    let config = EngineConfig::default();
    let clean = analyze_samples(&steady_descent(), "Clean".to_string(), SourceFormat::Gpx, &config);

    let mut glitched = steady_descent();
    glitched[50].latitude += 1000.0 / METERS_PER_DEGREE;
    let track = analyze_samples(&glitched, "Glitch".to_string(), SourceFormat::Gpx, &config);

    assert!(track.points[50].outlier);
    assert_eq!(track.runs.len(), 1);
    assert!((track.stats.total_distance - clean.stats.total_distance).abs() < 1e-6);
    assert!((track.stats.max_speed - clean.stats.max_speed).abs() < 0.5);
}

#[test]
fn test_glitched_first_fix_does_not_lose_the_track() {
    let mut samples = steady_descent();
    samples[0].latitude += 50_000.0 / METERS_PER_DEGREE;
    let track = analyze_samples(&samples, "Cold start".to_string(), SourceFormat::Gpx, &EngineConfig::default());

    let outliers = track.points.iter().filter(|p| p.outlier).count();
    assert!(outliers <= 3, "{outliers} outliers");
    assert_eq!(track.runs.len(), 1);
    assert!(track.stats.total_distance > 570.0);
    assert!(track.stats.total_distance < 600.5);
    assert!(track.runs[0].vertical_drop > 450.0);
    assert!(track.runs_are_consistent());
}

#[test]
fn test_out_of_order_fix_does_not_inflate_moving_time() {
    let mut samples = steady_descent();
    samples.swap(40, 41);
    let track = analyze_samples(&samples, "Jitter".to_string(), SourceFormat::Gpx, &EngineConfig::default());

    assert!(track.stats.moving_time_secs <= track.stats.duration_secs + 1e-9);
    assert!((track.stats.duration_secs - 99.0).abs() < 1e-9);
}

#[test]
fn test_ski_totals_bounded_by_track_totals() {
    let samples = track_from_legs(&[
        (20, 0.0, 0.0),
        (60, 10.0, -3.0),
        (120, 3.0, 2.0),
        (60, 10.0, -3.0),
        (20, 0.0, 0.0),
    ]);
    let track = analyze_samples(&samples, "Day".to_string(), SourceFormat::Fit, &EngineConfig::default());

    assert_eq!(track.runs.len(), 2);
    assert_eq!(track.stats.run_count, 2);
    assert_eq!(track.runs[0].id, 1);
    assert_eq!(track.runs[1].id, 2);
    assert!(track.stats.ski_distance <= track.stats.total_distance + 1e-9);
    assert!(track.stats.ski_vertical <= track.stats.total_descent + 1e-9);
    assert!(track.stats.total_ascent > 200.0);
    assert!(track.runs_are_consistent());
}

#[test]
fn test_short_dip_is_not_a_run() {
    let samples = track_from_legs(&[(20, 0.0, 0.0), (10, 5.0, -1.0), (20, 0.0, 0.0)]);
    let track = analyze_samples(&samples, "Dip".to_string(), SourceFormat::Gpx, &EngineConfig::default());

    assert!(track.runs.is_empty());
    assert_eq!(track.stats.ski_distance, 0.0);
    assert_eq!(track.stats.ski_vertical, 0.0);
    assert!(track.stats.total_descent > 0.0);
}

#[test]
fn test_incremental_matches_batch() {
    let config = EngineConfig::default();
    let samples = track_from_legs(&[
        (60, 10.0, -3.0),
        (90, 3.0, 2.0),
        (45, 12.0, -4.0),
        (10, 0.0, 0.0),
    ]);

    let batch = analyze_samples(&samples, "Day".to_string(), SourceFormat::Live, &config);

    let mut processor = TrackProcessor::with_config(config);
    for sample in &samples {
        processor.push(sample).unwrap();
    }
    let live = processor.finish("Day".to_string(), SourceFormat::Live);

    assert_eq!(live.runs, batch.runs);
    assert_eq!(live.stats, batch.stats);
}

#[test]
fn test_track_without_heart_rate() {
    let config = EngineConfig::default();
    let track = analyze_samples(&steady_descent(), "No HR".to_string(), SourceFormat::Gpx, &config);

    assert_eq!(track.stats.avg_heart_rate, None);
    assert_eq!(track.stats.max_heart_rate, None);
    assert!(analytics::heart_rate_zones(&track.points, &config.analytics).is_none());
    assert!(analytics::analyze(&track.points, &track.stats, &config.analytics)
        .heart_rate_zones
        .is_none());
}

#[test]
fn test_gpx_import_end_to_end() {
    let body: String = steady_descent()
        .iter()
        .map(|s| {
            format!(
                r#"<trkpt lat="{}" lon="{}"><ele>{}</ele><time>{}</time><extensions><gpxtpx:TrackPointExtension><gpxtpx:hr>150</gpxtpx:hr></gpxtpx:TrackPointExtension></extensions></trkpt>"#,
                s.latitude,
                s.longitude,
                s.elevation.unwrap_or_default(),
                s.timestamp.to_rfc3339()
            )
        })
        .collect();
    let gpx = format!(
        r#"<?xml version="1.0"?><gpx version="1.1" xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1"><trk><name>Black Run</name><trkseg>{body}</trkseg></trk></gpx>"#
    );

    let track = gpx_to_track(gpx.as_bytes(), None, &EngineConfig::default()).unwrap();
    assert_eq!(track.name, "Black Run");
    assert_eq!(track.points.len(), 100);
    assert_eq!(track.runs.len(), 1);
    assert_eq!(track.stats.avg_heart_rate, Some(150.0));
}

#[test]
fn test_stop_is_idempotent_and_discard_after_stop_is_noop() {
    let mut session = RecordingSession::new(
        MemoryCheckpointStore::new(),
        Box::new(GrantedAuthority),
        EngineConfig::default(),
    );
    session.start_recording("Morning", t0()).unwrap();
    for sample in &steady_descent() {
        session.on_location(to_fix(sample)).unwrap();
    }

    let end = t0() + Duration::seconds(100);
    let track = session.stop_recording(end).unwrap().unwrap();
    assert_eq!(track.runs.len(), 1);

    assert!(session.stop_recording(end).unwrap().is_none());
    session.discard_recording().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(session.store().is_empty());
}

#[test]
fn test_recovery_after_process_death() {
    let dir = tempfile::tempdir().unwrap();
    let samples = steady_descent();
    let recorded = 35;
    let persisted = 30;

    {
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let mut session =
            RecordingSession::new(store, Box::new(GrantedAuthority), EngineConfig::default());
        session.start_recording("Crashy", t0()).unwrap();
        for sample in &samples[..recorded] {
            let outcome = session.on_location(to_fix(sample)).unwrap();
            assert!(matches!(outcome, SampleOutcome::Recorded { .. }));
        }
        // Dropped without stop: the process died
    }

    let store = FileCheckpointStore::new(dir.path()).unwrap();
    let mut session = RecordingSession::new(store, Box::new(GrantedAuthority), EngineConfig::default());

    let info = session.check_for_recovery().unwrap();
    assert_eq!(info.name, "Crashy");
    assert_eq!(info.point_count, persisted);

    let stats = session.recover_recording().unwrap();
    assert_eq!(session.state(), SessionState::Recovered);

    let mut expected = TrackProcessor::new();
    for sample in &samples[..persisted] {
        expected.push(&to_fix(sample).to_raw_sample()).unwrap();
    }
    assert_eq!(stats, expected.snapshot());

    // Continue where the checkpoint left off
    session.resume_recording(samples[persisted].timestamp).unwrap();
    for sample in &samples[persisted..] {
        session.on_location(to_fix(sample)).unwrap();
    }
    let track = session
        .stop_recording(samples[99].timestamp)
        .unwrap()
        .unwrap();
    assert_eq!(track.points.len(), 100);
    assert_eq!(track.runs.len(), 1);
    assert!(session.check_for_recovery().is_none());
}
