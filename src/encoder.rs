//! Report encoding
//!
//! This module encodes finished tracks and live processor state into the JSON
//! payloads handed to the presentation layer. Values are always metric SI;
//! display formatting belongs to the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analytics::{self, Analytics};
use crate::config::AnalyticsConfig;
use crate::error::EngineError;
use crate::pipeline::TrackProcessor;
use crate::types::{Phase, Run, SourceFormat, Stats, Track, TrackPoint};
use crate::{ENGINE_VERSION, PRODUCER_NAME};

/// Current report schema version
pub const REPORT_VERSION: &str = "1.0.0";

/// Who produced a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportProducer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// Track identity and extent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub name: String,
    pub source: SourceFormat,
    pub point_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Full report for a finished track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackReport {
    pub report_version: String,
    pub producer: ReportProducer,
    pub computed_at_utc: String,
    pub track: TrackSummary,
    pub stats: Stats,
    pub runs: Vec<Run>,
    pub analytics: Analytics,
}

/// Compact per-sample update for a live recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub phase: Phase,
    pub point_count: usize,
    pub stats: Stats,
    /// The descent being recorded right now, not yet counted in `stats`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_run: Option<Run>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_point: Option<TrackPoint>,
}

/// Encoder for report payloads
pub struct ReportEncoder {
    instance_id: String,
}

impl Default for ReportEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    fn producer(&self) -> ReportProducer {
        ReportProducer {
            name: PRODUCER_NAME.to_string(),
            version: ENGINE_VERSION.to_string(),
            instance_id: self.instance_id.clone(),
        }
    }

    /// Build the full report for a finished track
    pub fn encode_track(&self, track: &Track, config: &AnalyticsConfig) -> TrackReport {
        TrackReport {
            report_version: REPORT_VERSION.to_string(),
            producer: self.producer(),
            computed_at_utc: Utc::now().to_rfc3339(),
            track: TrackSummary {
                name: track.name.clone(),
                source: track.source,
                point_count: track.points.len(),
                start_time: track.stats.start_time,
                end_time: track.stats.end_time,
            },
            stats: track.stats.clone(),
            runs: track.runs.clone(),
            analytics: analytics::analyze(&track.points, &track.stats, config),
        }
    }

    /// Encode a finished track to pretty JSON
    pub fn encode_track_to_json(
        &self,
        track: &Track,
        config: &AnalyticsConfig,
    ) -> Result<String, EngineError> {
        let report = self.encode_track(track, config);
        serde_json::to_string_pretty(&report).map_err(|e| EngineError::Encoding(e.to_string()))
    }

    /// Snapshot of a live processor
    pub fn encode_live(&self, processor: &TrackProcessor) -> LiveSnapshot {
        LiveSnapshot {
            phase: processor.phase(),
            point_count: processor.points().len(),
            stats: processor.snapshot(),
            open_run: processor.open_run(),
            last_point: processor.points().last().cloned(),
        }
    }

    /// Encode a live snapshot as a single JSON line
    pub fn encode_live_to_json(&self, processor: &TrackProcessor) -> Result<String, EngineError> {
        serde_json::to_string(&self.encode_live(processor))
            .map_err(|e| EngineError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::analyze_samples;
    use crate::types::RawSample;
    use chrono::{Duration, TimeZone};

    fn make_test_samples(heart_rate: Option<f64>) -> Vec<RawSample> {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
        (0..70)
            .map(|i| {
                let mut s = RawSample::new(
                    46.0 + i as f64 * 9.0 / 111_195.0,
                    7.0,
                    t0 + Duration::seconds(i),
                );
                s.elevation = Some(2400.0 - i as f64 * 2.5);
                s.heart_rate = heart_rate;
                s
            })
            .collect()
    }

    #[test]
    fn test_encode_track_report() {
        let config = EngineConfig::default();
        let track = analyze_samples(
            &make_test_samples(Some(150.0)),
            "Piste".to_string(),
            SourceFormat::Gpx,
            &config,
        );
        let encoder = ReportEncoder::with_instance_id("test-instance".to_string());
        let report = encoder.encode_track(&track, &config.analytics);

        assert_eq!(report.report_version, REPORT_VERSION);
        assert_eq!(report.producer.name, PRODUCER_NAME);
        assert_eq!(report.producer.version, ENGINE_VERSION);
        assert_eq!(report.producer.instance_id, "test-instance");
        assert_eq!(report.track.point_count, 70);
        assert_eq!(report.runs.len(), 1);
        assert!(report.analytics.heart_rate_zones.is_some());
        assert!(report.analytics.performance.score > 0.0);
    }

    #[test]
    fn test_encode_to_json_omits_missing_heart_rate() {
        let config = EngineConfig::default();
        let track = analyze_samples(
            &make_test_samples(None),
            "Piste".to_string(),
            SourceFormat::Fit,
            &config,
        );
        let json = ReportEncoder::new()
            .encode_track_to_json(&track, &config.analytics)
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["track"]["source"], "fit");
        assert!(parsed["analytics"].get("heart_rate_zones").is_none());
        assert!(parsed["stats"].get("avg_heart_rate").is_none());
        assert!(parsed.get("producer").is_some());
    }

    #[test]
    fn test_encode_live_snapshot() {
        let mut processor = TrackProcessor::new();
        for sample in make_test_samples(None).iter().take(20) {
            processor.push(sample).unwrap();
        }
        let encoder = ReportEncoder::new();
        let snapshot = encoder.encode_live(&processor);

        assert_eq!(snapshot.point_count, 20);
        assert_eq!(snapshot.phase, Phase::Descending);
        assert!(snapshot.open_run.is_some());

        let line = encoder.encode_live_to_json(&processor).unwrap();
        assert!(!line.contains('\n'));
    }
}
