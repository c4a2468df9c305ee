//! Core types for the ski telemetry pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw samples from a file or a live sensor, kinematically annotated
//! track points, descent runs, and the whole-track statistics snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a track's points came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Gpx,
    Fit,
    Live,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Gpx => "gpx",
            SourceFormat::Fit => "fit",
            SourceFormat::Live => "live",
        }
    }

    /// Guess a track file's format from its name, falling back to its content
    pub fn detect(file_name: &str, bytes: &[u8]) -> Option<Self> {
        crate::adapters::detect_format(file_name, bytes)
    }
}

/// One position sample before kinematic annotation.
///
/// Format adapters and the live sample schema both produce this shape; it is
/// also what the recording checkpoint persists, so replay runs the exact
/// pipeline a live sample went through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Latitude (degrees, WGS84)
    pub latitude: f64,
    /// Longitude (degrees, WGS84)
    pub longitude: f64,
    /// Elevation (meters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    /// Sample time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Speed reported by the source (m/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Heart rate (bpm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    /// Horizontal accuracy of the fix (meters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl RawSample {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
            timestamp,
            speed: None,
            heart_rate: None,
            accuracy: None,
        }
    }

    /// Check if the coordinates are finite and inside WGS84 bounds.
    pub fn has_plausible_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
    }
}

/// A track point annotated with derived kinematics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Instantaneous speed (m/s)
    pub speed: f64,
    pub heart_rate: Option<f64>,
    /// Grade (rise over run) against the previous reference point
    pub slope: f64,
    /// Surface distance contributed since the previous reference point (meters)
    pub distance: f64,
    /// Seconds since the previous point in the sequence (0 for the first point)
    pub elapsed: f64,
    /// Set when the point was rejected as a position glitch
    #[serde(default)]
    pub outlier: bool,
}

/// Movement phase used by run segmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ascending,
    Descending,
    Stationary,
}

/// One qualified descent segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// 1-based ordinal within the track
    pub id: u32,
    /// First point of the run (inclusive)
    pub start_index: usize,
    /// Last point of the run (inclusive)
    pub end_index: usize,
    /// Surface distance (meters)
    pub distance: f64,
    /// Elevation lost, start minus end (meters, never negative)
    pub vertical_drop: f64,
    /// Mean point speed (m/s)
    pub avg_speed: f64,
    /// Maximum point speed (m/s)
    pub max_speed: f64,
    /// Duration (seconds)
    pub duration_secs: f64,
    pub start_elevation: f64,
    pub end_elevation: f64,
    /// Vertical drop over distance
    pub avg_slope: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_heart_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_heart_rate: Option<f64>,
}

/// Whole-track aggregate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Total surface distance (meters)
    pub total_distance: f64,
    /// Distance inside qualified runs (meters)
    pub ski_distance: f64,
    /// Total elevation gained (meters)
    pub total_ascent: f64,
    /// Total elevation lost (meters)
    pub total_descent: f64,
    /// Sum of run vertical drops (meters)
    pub ski_vertical: f64,
    /// Maximum point speed (m/s)
    pub max_speed: f64,
    /// Mean point speed (m/s)
    pub avg_speed: f64,
    /// Ski distance over ski time (m/s)
    pub avg_ski_speed: f64,
    pub max_altitude: Option<f64>,
    pub min_altitude: Option<f64>,
    /// Max altitude minus min altitude (meters)
    pub elevation_delta: f64,
    /// Wall-clock span of the track (seconds)
    pub duration_secs: f64,
    /// Time spent at or above the moving-speed threshold (seconds)
    pub moving_time_secs: f64,
    /// Mean absolute grade
    pub avg_slope: f64,
    /// Steepest absolute grade
    pub max_slope: f64,
    pub run_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_heart_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_heart_rate: Option<f64>,
}

/// A finished track: points, statistics and runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub source: SourceFormat,
    pub points: Vec<TrackPoint>,
    pub stats: Stats,
    pub runs: Vec<Run>,
}

impl Track {
    /// Check that runs are ordered, non-overlapping and inside the point range.
    pub fn runs_are_consistent(&self) -> bool {
        let mut previous_end: Option<usize> = None;
        for run in &self.runs {
            if run.start_index >= run.end_index || run.end_index >= self.points.len() {
                return false;
            }
            if let Some(end) = previous_end {
                if run.start_index <= end {
                    return false;
                }
            }
            previous_end = Some(run.end_index);
        }
        self.stats.run_count == self.runs.len()
    }
}
