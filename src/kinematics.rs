//! Geodesic distance and per-point kinematics
//!
//! Every distance in the engine goes through [`surface_distance`], so run
//! thresholds are always compared against the same (haversine) metric.
//!
//! Annotation is incremental: [`Kinematics`] keeps the last accepted point as
//! its reference, which lets the batch importer and the live recorder share
//! one code path. When several consecutive outliers agree with each other the
//! reference moves to them, so a bad reference point cannot reject the rest of
//! the track.

use chrono::{DateTime, Utc};
use geo::{Distance, Haversine, Point};

use crate::config::KinematicsConfig;
use crate::types::{RawSample, TrackPoint};

/// Great-circle surface distance between two positions (meters)
pub fn surface_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let point1 = Point::new(lon1, lat1);
    let point2 = Point::new(lon2, lat2);
    Haversine::distance(point1, point2)
}

/// Seconds between two timestamps, with millisecond resolution
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// A position used as a motion reference
#[derive(Debug, Clone)]
struct Anchor {
    latitude: f64,
    longitude: f64,
    elevation: Option<f64>,
    timestamp: DateTime<Utc>,
}

impl Anchor {
    fn of(sample: &RawSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            elevation: sample.elevation,
            timestamp: sample.timestamp,
        }
    }

    fn distance_to(&self, sample: &RawSample) -> f64 {
        surface_distance(self.latitude, self.longitude, sample.latitude, sample.longitude)
    }
}

/// Incremental point annotator
#[derive(Debug, Clone)]
pub struct Kinematics {
    config: KinematicsConfig,
    /// Last accepted (non-outlier) position
    anchor: Option<Anchor>,
    previous: Option<TrackPoint>,
    /// Latest timestamp seen, accepted or not
    latest: Option<DateTime<Utc>>,
    /// Trailing outliers that agree with each other
    candidates: Vec<Anchor>,
}

impl Kinematics {
    pub fn new(config: KinematicsConfig) -> Self {
        Self {
            config,
            anchor: None,
            previous: None,
            latest: None,
            candidates: Vec::new(),
        }
    }

    /// Derive distance, elapsed time, speed and slope for the next sample.
    pub fn annotate(&mut self, sample: &RawSample) -> TrackPoint {
        let mut point = TrackPoint {
            latitude: sample.latitude,
            longitude: sample.longitude,
            elevation: sample.elevation,
            timestamp: sample.timestamp,
            speed: 0.0,
            heart_rate: sample.heart_rate,
            slope: 0.0,
            distance: 0.0,
            elapsed: 0.0,
            outlier: false,
        };

        let reference = match (&self.previous, &self.anchor, self.latest) {
            (Some(previous), Some(anchor), Some(latest)) => {
                Some((latest, previous.speed, previous.slope, anchor.clone()))
            }
            _ => None,
        };
        let Some((latest, previous_speed, previous_slope, anchor)) = reference else {
            point.speed = self.plausible_source_speed(sample).unwrap_or(0.0);
            self.latest = Some(sample.timestamp);
            self.accept(&point);
            return point;
        };

        point.elapsed = seconds_between(latest, sample.timestamp).max(0.0);
        self.latest = Some(latest.max(sample.timestamp));
        let since_anchor = seconds_between(anchor.timestamp, sample.timestamp);

        // Duplicate or out-of-order sample: no distance, carry kinematics
        if point.elapsed <= 0.0 || since_anchor <= 0.0 {
            point.speed = previous_speed;
            point.slope = previous_slope;
            self.previous = Some(point.clone());
            return point;
        }

        let distance = anchor.distance_to(sample);
        let geometric_speed = distance / since_anchor;

        if geometric_speed <= self.config.max_plausible_speed_mps {
            self.candidates.clear();
            return self.moved(point, sample, &anchor, previous_slope);
        }

        if let Some(from) = self.reanchor_candidate(sample) {
            log::debug!(
                "re-anchoring at {} after {} consistent outliers",
                sample.timestamp,
                self.candidates.len()
            );
            self.candidates.clear();
            self.anchor = Some(from.clone());
            return self.moved(point, sample, &from, previous_slope);
        }

        log::debug!(
            "position glitch at {}: {:.0} m/s implied",
            sample.timestamp,
            geometric_speed
        );
        point.outlier = true;
        point.speed = previous_speed;
        point.slope = previous_slope;
        self.previous = Some(point.clone());
        point
    }

    /// Annotate a whole sequence in order.
    pub fn annotate_all(config: KinematicsConfig, samples: &[RawSample]) -> Vec<TrackPoint> {
        let mut kinematics = Kinematics::new(config);
        samples.iter().map(|s| kinematics.annotate(s)).collect()
    }

    /// Fill in motion relative to `from` and accept the point.
    fn moved(
        &mut self,
        mut point: TrackPoint,
        sample: &RawSample,
        from: &Anchor,
        previous_slope: f64,
    ) -> TrackPoint {
        let distance = from.distance_to(sample);
        let since = seconds_between(from.timestamp, sample.timestamp);

        point.distance = distance;
        point.speed = self
            .plausible_source_speed(sample)
            .unwrap_or(distance / since);
        point.slope = match (from.elevation, sample.elevation) {
            (Some(start), Some(end)) if distance >= self.config.min_slope_distance_m => {
                (end - start) / distance
            }
            _ => previous_slope,
        };

        self.accept(&point);
        point
    }

    /// Track an outlier. Once enough consecutive outliers agree with each
    /// other, returns the position to re-anchor from.
    fn reanchor_candidate(&mut self, sample: &RawSample) -> Option<Anchor> {
        let needed = self.config.reanchor_after_outliers;
        if needed == 0 {
            return None;
        }

        let consistent = self.candidates.last().map_or(false, |last| {
            let dt = seconds_between(last.timestamp, sample.timestamp);
            dt > 0.0 && last.distance_to(sample) / dt <= self.config.max_plausible_speed_mps
        });
        if !consistent {
            self.candidates.clear();
        }
        self.candidates.push(Anchor::of(sample));

        if self.candidates.len() < needed.max(2) {
            return None;
        }
        self.candidates.iter().rev().nth(1).cloned()
    }

    fn accept(&mut self, point: &TrackPoint) {
        // Keep the last known elevation so a fix without altitude does not
        // break the slope reference
        let elevation = point
            .elevation
            .or_else(|| self.anchor.as_ref().and_then(|a| a.elevation));
        self.anchor = Some(Anchor {
            latitude: point.latitude,
            longitude: point.longitude,
            elevation,
            timestamp: point.timestamp,
        });
        self.previous = Some(point.clone());
    }

    fn plausible_source_speed(&self, sample: &RawSample) -> Option<f64> {
        sample
            .speed
            .filter(|s| s.is_finite() && *s >= 0.0 && *s <= self.config.max_plausible_speed_mps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn sample(secs: i64, lat: f64, ele: f64) -> RawSample {
        let mut s = RawSample::new(lat, 7.0, t(secs));
        s.elevation = Some(ele);
        s
    }

    #[test]
    fn test_surface_distance_one_degree_latitude() {
        let d = surface_distance(46.0, 7.0, 47.0, 7.0);
        assert!((d - 111_195.0).abs() < 100.0);
        assert_eq!(surface_distance(46.0, 7.0, 46.0, 7.0), 0.0);
    }

    #[test]
    fn test_speed_is_distance_over_time() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        let p = k.annotate(&sample(4, 46.0004, 1990.0));

        assert!(p.distance > 40.0);
        assert!((p.speed - p.distance / 4.0).abs() < 1e-9);
        assert!((p.elapsed - 4.0).abs() < 1e-9);
        assert!((p.slope - (-10.0 / p.distance)).abs() < 1e-9);
    }

    #[test]
    fn test_first_point_has_no_motion() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        let p = k.annotate(&sample(0, 46.0, 2000.0));
        assert_eq!(p.distance, 0.0);
        assert_eq!(p.elapsed, 0.0);
        assert_eq!(p.speed, 0.0);
    }

    #[test]
    fn test_duplicate_timestamp_copies_previous() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        let moving = k.annotate(&sample(2, 46.0002, 1995.0));
        let dup = k.annotate(&sample(2, 46.0003, 1990.0));

        assert_eq!(dup.distance, 0.0);
        assert_eq!(dup.speed, moving.speed);
        assert_eq!(dup.slope, moving.slope);
        assert!(dup.speed.is_finite());
    }

    #[test]
    fn test_out_of_order_sample_has_no_negative_speed() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(10, 46.0, 2000.0));
        let back = k.annotate(&sample(5, 46.001, 1990.0));
        assert_eq!(back.distance, 0.0);
        assert!(back.speed >= 0.0);
    }

    #[test]
    fn test_source_speed_preferred_when_plausible() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        let mut s = sample(1, 46.0001, 1999.0);
        s.speed = Some(9.5);
        assert_eq!(k.annotate(&s).speed, 9.5);

        let mut s = sample(2, 46.0002, 1998.0);
        s.speed = Some(400.0);
        let p = k.annotate(&s);
        assert!((p.speed - p.distance).abs() < 1e-9);
    }

    #[test]
    fn test_glitch_is_flagged_and_skipped() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        let before = k.annotate(&sample(1, 46.0001, 1999.0));
        let glitch = k.annotate(&sample(2, 46.01, 1999.0));
        let after = k.annotate(&sample(3, 46.0003, 1997.0));

        assert!(glitch.outlier);
        assert_eq!(glitch.distance, 0.0);
        assert_eq!(glitch.speed, before.speed);
        assert!(!after.outlier);
        // Measured from the last good point, two seconds earlier
        assert!((after.distance - surface_distance(46.0001, 7.0, 46.0003, 7.0)).abs() < 1e-6);
        assert!((after.speed - after.distance / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_slope_carried_when_nearly_stationary() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        let moving = k.annotate(&sample(1, 46.0001, 1998.0));
        let still = k.annotate(&sample(2, 46.0001, 1997.0));
        assert_eq!(still.slope, moving.slope);
        assert!(still.slope.is_finite());
    }

    #[test]
    fn test_elapsed_measured_from_latest_timestamp() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        let p = k.annotate(&sample(10, 46.0005, 1995.0));
        assert!((p.elapsed - 10.0).abs() < 1e-9);

        let back = k.annotate(&sample(5, 46.0006, 1994.0));
        assert_eq!(back.elapsed, 0.0);

        let next = k.annotate(&sample(11, 46.0007, 1993.0));
        assert!((next.elapsed - 1.0).abs() < 1e-9);
        assert!(!next.outlier);
    }

    #[test]
    fn test_glitched_first_point_is_left_behind() {
        let step = 6.0 / 111_195.0;
        let mut samples = vec![sample(0, 46.0 + 50_000.0 / 111_195.0, 2000.0)];
        samples.extend((1..20).map(|i| sample(i, 46.0 + step * i as f64, 2000.0 - i as f64)));

        let points = Kinematics::annotate_all(KinematicsConfig::default(), &samples);

        assert!(points[1].outlier);
        assert!(points[2].outlier);
        assert!(!points[3].outlier);
        assert!((points[3].distance - 6.0).abs() < 0.01);
        assert!((points[3].speed - 6.0).abs() < 0.01);
        assert!((points[3].slope - (-1.0 / points[3].distance)).abs() < 1e-6);
        assert!(points[4..].iter().all(|p| !p.outlier && (p.distance - 6.0).abs() < 0.01));
    }

    #[test]
    fn test_scattered_glitches_never_become_the_reference() {
        let mut k = Kinematics::new(KinematicsConfig::default());
        k.annotate(&sample(0, 46.0, 2000.0));
        for i in 1..8 {
            // Alternate between two far-apart ghosts
            let lat = if i % 2 == 0 { 46.5 } else { 45.5 };
            assert!(k.annotate(&sample(i, lat, 2000.0)).outlier);
        }
        let back = k.annotate(&sample(8, 46.0001, 1999.0));
        assert!(!back.outlier);
        assert!((back.distance - surface_distance(46.0, 7.0, 46.0001, 7.0)).abs() < 1e-6);
    }

    #[test]
    fn test_reanchoring_can_be_disabled() {
        let config = KinematicsConfig {
            reanchor_after_outliers: 0,
            ..KinematicsConfig::default()
        };
        let step = 6.0 / 111_195.0;
        let mut samples = vec![sample(0, 47.0, 2000.0)];
        samples.extend((1..10).map(|i| sample(i, 46.0 + step * i as f64, 2000.0)));

        let points = Kinematics::annotate_all(config, &samples);
        assert!(points[1..].iter().all(|p| p.outlier));
    }
}
