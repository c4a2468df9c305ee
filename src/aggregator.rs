//! Statistics aggregator
//!
//! Keeps running sums, counts and extrema for a track and the list of closed
//! runs. The same update rule serves batch import and live recording; the
//! averages are only divided out in [`StatsAggregator::snapshot`].

use chrono::{DateTime, Utc};

use crate::kinematics::seconds_between;
use crate::types::{Run, Stats, TrackPoint};

/// Running aggregate over a track
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    moving_speed_mps: f64,
    point_count: usize,
    total_distance: f64,
    total_ascent: f64,
    total_descent: f64,
    /// Elevation of the last accepted point that had one
    last_elevation: Option<f64>,
    max_altitude: Option<f64>,
    min_altitude: Option<f64>,
    speed_sum: f64,
    speed_count: usize,
    max_speed: f64,
    slope_sum: f64,
    slope_count: usize,
    max_slope: f64,
    hr_sum: f64,
    hr_count: usize,
    max_hr: Option<f64>,
    moving_time_secs: f64,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    ski_distance: f64,
    ski_vertical: f64,
    ski_time_secs: f64,
    runs: Vec<Run>,
}

impl StatsAggregator {
    /// Create an aggregator; points at or above `moving_speed_mps` count as moving time
    pub fn new(moving_speed_mps: f64) -> Self {
        Self {
            moving_speed_mps,
            point_count: 0,
            total_distance: 0.0,
            total_ascent: 0.0,
            total_descent: 0.0,
            last_elevation: None,
            max_altitude: None,
            min_altitude: None,
            speed_sum: 0.0,
            speed_count: 0,
            max_speed: 0.0,
            slope_sum: 0.0,
            slope_count: 0,
            max_slope: 0.0,
            hr_sum: 0.0,
            hr_count: 0,
            max_hr: None,
            moving_time_secs: 0.0,
            start_time: None,
            end_time: None,
            ski_distance: 0.0,
            ski_vertical: 0.0,
            ski_time_secs: 0.0,
            runs: Vec::new(),
        }
    }

    /// Fold one annotated point into the running totals.
    ///
    /// `previous` is the point before it in the track, `None` for the first.
    pub fn ingest(&mut self, point: &TrackPoint, previous: Option<&TrackPoint>) {
        self.point_count += 1;

        if self.start_time.is_none() {
            self.start_time = Some(point.timestamp);
        }
        // Timestamps are non-decreasing in a well-formed track; keep the
        // latest seen so an out-of-order sample cannot shorten the duration
        self.end_time = Some(match self.end_time {
            Some(end) if end > point.timestamp => end,
            _ => point.timestamp,
        });

        if let Some(hr) = point.heart_rate {
            self.hr_sum += hr;
            self.hr_count += 1;
            self.max_hr = Some(self.max_hr.map_or(hr, |m| m.max(hr)));
        }

        if point.outlier {
            return;
        }

        self.total_distance += point.distance;

        if let Some(elevation) = point.elevation {
            if let Some(last) = self.last_elevation {
                let delta = elevation - last;
                if delta > 0.0 {
                    self.total_ascent += delta;
                } else {
                    self.total_descent -= delta;
                }
            }
            self.last_elevation = Some(elevation);
            self.max_altitude = Some(self.max_altitude.map_or(elevation, |m| m.max(elevation)));
            self.min_altitude = Some(self.min_altitude.map_or(elevation, |m| m.min(elevation)));
        }

        // The first point has no motion of its own
        if previous.is_none() {
            return;
        }

        self.speed_sum += point.speed;
        self.speed_count += 1;
        self.max_speed = self.max_speed.max(point.speed);

        let slope = point.slope.abs();
        self.slope_sum += slope;
        self.slope_count += 1;
        self.max_slope = self.max_slope.max(slope);

        if point.speed >= self.moving_speed_mps {
            self.moving_time_secs += point.elapsed;
        }
    }

    /// Record a closed run and its run-scoped totals.
    pub fn close_run(&mut self, run: Run) {
        self.ski_distance += run.distance;
        self.ski_vertical += run.vertical_drop;
        self.ski_time_secs += run.duration_secs;
        self.runs.push(run);
    }

    /// Closed runs, in track order
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Produce the current statistics without touching running state.
    pub fn snapshot(&self) -> Stats {
        let mean = |sum: f64, count: usize| if count > 0 { sum / count as f64 } else { 0.0 };

        let elevation_delta = match (self.max_altitude, self.min_altitude) {
            (Some(max), Some(min)) => max - min,
            _ => 0.0,
        };

        let duration_secs = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => seconds_between(start, end),
            _ => 0.0,
        };

        Stats {
            total_distance: self.total_distance,
            ski_distance: self.ski_distance,
            total_ascent: self.total_ascent,
            total_descent: self.total_descent,
            ski_vertical: self.ski_vertical,
            max_speed: self.max_speed,
            avg_speed: mean(self.speed_sum, self.speed_count),
            avg_ski_speed: if self.ski_time_secs > 0.0 {
                self.ski_distance / self.ski_time_secs
            } else {
                0.0
            },
            max_altitude: self.max_altitude,
            min_altitude: self.min_altitude,
            elevation_delta,
            duration_secs,
            moving_time_secs: self.moving_time_secs,
            avg_slope: mean(self.slope_sum, self.slope_count),
            max_slope: self.max_slope,
            run_count: self.runs.len(),
            start_time: self.start_time,
            end_time: self.end_time,
            avg_heart_rate: (self.hr_count > 0).then(|| self.hr_sum / self.hr_count as f64),
            max_heart_rate: self.max_hr,
        }
    }

    /// Aggregate a finished track in one pass.
    pub fn aggregate(points: &[TrackPoint], runs: &[Run], moving_speed_mps: f64) -> Stats {
        let mut aggregator = StatsAggregator::new(moving_speed_mps);
        let mut previous = None;
        for point in points {
            aggregator.ingest(point, previous);
            previous = Some(point);
        }
        for run in runs {
            aggregator.close_run(run.clone());
        }
        aggregator.snapshot()
    }
}
