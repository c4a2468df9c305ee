//! Derived analytics
//!
//! Presentation-ready views computed on demand from the points and the
//! current statistics: a speed histogram, heart-rate zone occupancy and a
//! composite performance score. Nothing here mutates pipeline state.

use serde::{Deserialize, Serialize};

use crate::config::AnalyticsConfig;
use crate::types::{Stats, TrackPoint};

const SPEED_WEIGHT: f64 = 0.40;
const VERTICAL_WEIGHT: f64 = 0.35;
const MOTION_WEIGHT: f64 = 0.25;

/// One speed bucket, `[lower, upper)` in m/s
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedBucket {
    pub lower_mps: f64,
    /// Upper bound; `None` for the open top bucket
    pub upper_mps: Option<f64>,
    pub samples: u32,
    pub time_secs: f64,
    /// Share of total elapsed time (0-1)
    pub time_share: f64,
}

/// Speed distribution over the track's points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedHistogram {
    pub buckets: Vec<SpeedBucket>,
    pub total_samples: u32,
    pub total_time_secs: f64,
}

/// Heart-rate zone occupancy (zones 1-5)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateZones {
    /// Upper bounds of zones 1-4 (bpm); zone 5 is everything above
    pub thresholds_bpm: [f64; 4],
    pub zone_samples: [u32; 5],
    pub zone_time_secs: [f64; 5],
    /// Share of heart-rate time in each zone (0-1)
    pub zone_shares: [f64; 5],
}

impl HeartRateZones {
    /// Zone (1-5) for a heart rate
    pub fn zone_for(thresholds: &[f64; 4], bpm: f64) -> usize {
        for (i, &threshold) in thresholds.iter().enumerate() {
            if bpm <= threshold {
                return i + 1;
            }
        }
        5
    }

    /// Share for a specific zone (1-5)
    pub fn zone_share(&self, zone: usize) -> f64 {
        if (1..=5).contains(&zone) {
            self.zone_shares[zone - 1]
        } else {
            0.0
        }
    }
}

/// Composite score with its individual contributions (each 0-1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceScore {
    /// 0-100
    pub score: f64,
    pub speed: Option<f64>,
    pub vertical: Option<f64>,
    pub motion: Option<f64>,
}

/// All derived analytics for a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub speed_histogram: SpeedHistogram,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate_zones: Option<HeartRateZones>,
    pub performance: PerformanceScore,
}

/// Compute every derived view.
pub fn analyze(points: &[TrackPoint], stats: &Stats, config: &AnalyticsConfig) -> Analytics {
    Analytics {
        speed_histogram: speed_histogram(points, &config.speed_bucket_boundaries_mps),
        heart_rate_zones: heart_rate_zones(points, config),
        performance: performance_score(stats, config),
    }
}

/// Bucket point speeds by the given ascending boundaries (m/s).
///
/// `n` boundaries give `n + 1` buckets. The first point and outliers carry no
/// motion of their own and are skipped.
pub fn speed_histogram(points: &[TrackPoint], boundaries: &[f64]) -> SpeedHistogram {
    let mut bounds: Vec<f64> = boundaries.iter().copied().filter(|b| b.is_finite()).collect();
    bounds.sort_by(|a, b| a.total_cmp(b));
    bounds.dedup();

    let mut buckets: Vec<SpeedBucket> = (0..=bounds.len())
        .map(|i| SpeedBucket {
            lower_mps: if i == 0 { 0.0 } else { bounds[i - 1] },
            upper_mps: bounds.get(i).copied(),
            samples: 0,
            time_secs: 0.0,
            time_share: 0.0,
        })
        .collect();

    let mut total_samples = 0u32;
    let mut total_time = 0.0;

    for point in points.iter().skip(1).filter(|p| !p.outlier) {
        let index = bounds.partition_point(|&b| b <= point.speed);
        let bucket = &mut buckets[index];
        bucket.samples += 1;
        bucket.time_secs += point.elapsed;
        total_samples += 1;
        total_time += point.elapsed;
    }

    if total_time > 0.0 {
        for bucket in &mut buckets {
            bucket.time_share = bucket.time_secs / total_time;
        }
    }

    SpeedHistogram {
        buckets,
        total_samples,
        total_time_secs: total_time,
    }
}

/// Zone thresholds from the configured max heart rate, or the fixed bpm table.
pub fn zone_thresholds(config: &AnalyticsConfig) -> [f64; 4] {
    match config.max_heart_rate {
        Some(max_hr) if max_hr > 0.0 => config.zone_fractions.map(|f| max_hr * f),
        _ => config.fixed_zone_bpm,
    }
}

/// Heart-rate zone occupancy by elapsed time; `None` when no point has a heart rate.
pub fn heart_rate_zones(points: &[TrackPoint], config: &AnalyticsConfig) -> Option<HeartRateZones> {
    let thresholds = zone_thresholds(config);
    let mut zone_samples = [0u32; 5];
    let mut zone_time_secs = [0.0f64; 5];

    for point in points {
        if let Some(bpm) = point.heart_rate {
            let zone = HeartRateZones::zone_for(&thresholds, bpm);
            zone_samples[zone - 1] += 1;
            zone_time_secs[zone - 1] += point.elapsed;
        }
    }

    let total_samples: u32 = zone_samples.iter().sum();
    if total_samples == 0 {
        return None;
    }

    let total_time: f64 = zone_time_secs.iter().sum();
    let zone_shares = if total_time > 0.0 {
        zone_time_secs.map(|t| t / total_time)
    } else {
        // Single reading or no elapsed time: fall back to sample share
        zone_samples.map(|n| n as f64 / total_samples as f64)
    };

    Some(HeartRateZones {
        thresholds_bpm: thresholds,
        zone_samples,
        zone_time_secs,
        zone_shares,
    })
}

/// Composite 0-100 score from speed, vertical-per-run and time in motion.
///
/// A contribution whose input is missing is left out and the remaining
/// weights are renormalized.
pub fn performance_score(stats: &Stats, config: &AnalyticsConfig) -> PerformanceScore {
    let ratio = |value: f64, reference: f64| {
        (reference > 0.0 && value.is_finite()).then(|| (value / reference).clamp(0.0, 1.0))
    };

    let has_runs = stats.run_count > 0;
    let speed = has_runs
        .then(|| ratio(stats.avg_ski_speed, config.score_reference_speed_mps))
        .flatten();
    let vertical = has_runs
        .then(|| {
            ratio(
                stats.ski_vertical / stats.run_count as f64,
                config.score_reference_vertical_per_run_m,
            )
        })
        .flatten();
    let motion = (stats.duration_secs > 0.0)
        .then(|| ratio(stats.moving_time_secs, stats.duration_secs))
        .flatten();

    let (weighted, weights) = [
        (speed, SPEED_WEIGHT),
        (vertical, VERTICAL_WEIGHT),
        (motion, MOTION_WEIGHT),
    ]
    .iter()
    .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
    .fold((0.0, 0.0), |(sum, total), (v, w)| (sum + v, total + w));

    let score = if weights > 0.0 {
        (weighted / weights * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    PerformanceScore {
        score,
        speed,
        vertical,
        motion,
    }
}
