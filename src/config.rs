//! Engine configuration
//!
//! Every threshold the pipeline uses lives here. All fields have defaults so a
//! partial JSON document (or none at all) yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the whole engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kinematics: KinematicsConfig,
    pub segmentation: SegmentationConfig,
    pub session: SessionConfig,
    pub analytics: AnalyticsConfig,
}

impl EngineConfig {
    /// Load configuration from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Thresholds for distance/speed/slope derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinematicsConfig {
    /// Speeds above this (m/s) are treated as noise
    pub max_plausible_speed_mps: f64,
    /// Below this horizontal distance (m) slope is carried forward
    pub min_slope_distance_m: f64,
    /// Consecutive, mutually consistent outliers after which the reference
    /// point moves to them (0 disables)
    pub reanchor_after_outliers: usize,
}

impl Default for KinematicsConfig {
    fn default() -> Self {
        Self {
            max_plausible_speed_mps: 150.0,
            min_slope_distance_m: 1.0,
            reanchor_after_outliers: 3,
        }
    }
}

/// Thresholds for run segmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Rolling window (point pairs) for elevation rate and speed
    pub window_samples: usize,
    /// Elevation loss rate (m/s) above which a window counts as descending
    pub descent_rate_mps: f64,
    /// Elevation gain rate (m/s) above which a window counts as ascending
    pub ascent_rate_mps: f64,
    /// Minimum mean speed (m/s) for a window to count as moving
    pub min_moving_speed_mps: f64,
    /// Consecutive samples a new phase must hold before it is accepted
    pub sustain_samples: usize,
    /// Minimum run distance (m)
    pub min_run_distance_m: f64,
    /// Minimum run vertical drop (m)
    pub min_run_vertical_m: f64,
    /// Descents separated by a shorter non-descending gap (s) are merged
    pub max_merge_gap_secs: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            window_samples: 5,
            descent_rate_mps: 0.15,
            ascent_rate_mps: 0.15,
            min_moving_speed_mps: 1.0,
            sustain_samples: 3,
            min_run_distance_m: 100.0,
            min_run_vertical_m: 20.0,
            max_merge_gap_secs: 30.0,
        }
    }
}

/// Recording session lifecycle and checkpoint cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for a first usable fix
    pub acquisition_timeout_secs: i64,
    /// Worst horizontal accuracy (m) accepted as a first fix
    pub acquisition_accuracy_m: f64,
    /// Flush the checkpoint after this many buffered points
    pub flush_every_points: usize,
    /// Flush the checkpoint when the oldest buffered point is this old (s)
    pub flush_interval_secs: i64,
    /// Fold live segments into a chunk once this many exist
    pub compact_after_segments: u32,
    /// Consecutive flush failures before the session raises a warning
    pub max_consecutive_flush_failures: u32,
    /// Heart-rate readings older than this (s) are not attached to positions
    pub heart_rate_max_age_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acquisition_timeout_secs: 60,
            acquisition_accuracy_m: 50.0,
            flush_every_points: 10,
            flush_interval_secs: 15,
            compact_after_segments: 16,
            max_consecutive_flush_failures: 3,
            heart_rate_max_age_secs: 5,
        }
    }
}

/// Inputs for derived analytics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Ascending speed bucket boundaries (m/s), supplied by the unit layer
    pub speed_bucket_boundaries_mps: Vec<f64>,
    /// Athlete maximum heart rate (bpm); zones fall back to fixed bpm when absent
    pub max_heart_rate: Option<f64>,
    /// Upper bounds of zones 1-4 as fractions of max heart rate
    pub zone_fractions: [f64; 4],
    /// Upper bounds of zones 1-4 in bpm when no max heart rate is configured
    pub fixed_zone_bpm: [f64; 4],
    /// Speed (m/s) at or above which a point counts as moving
    pub moving_speed_mps: f64,
    /// Average ski speed (m/s) that earns the full speed contribution
    pub score_reference_speed_mps: f64,
    /// Vertical per run (m) that earns the full efficiency contribution
    pub score_reference_vertical_per_run_m: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            // 10/20/30/40/50 km/h expressed in m/s
            speed_bucket_boundaries_mps: vec![2.78, 5.56, 8.33, 11.11, 13.89],
            max_heart_rate: None,
            zone_fractions: [0.60, 0.70, 0.80, 0.90],
            fixed_zone_bpm: [120.0, 140.0, 155.0, 170.0],
            moving_speed_mps: 1.0,
            score_reference_speed_mps: 12.0,
            score_reference_vertical_per_run_m: 250.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "segmentation": { "min_run_vertical_m": 40.0 } }"#;
        let config = EngineConfig::from_json(json).unwrap();

        assert_eq!(config.segmentation.min_run_vertical_m, 40.0);
        assert_eq!(config.segmentation.sustain_samples, 3);
        assert_eq!(config.kinematics, KinematicsConfig::default());
        assert_eq!(config.session.flush_every_points, 10);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = EngineConfig::default();
        config.analytics.max_heart_rate = Some(190.0);
        let json = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }
}
