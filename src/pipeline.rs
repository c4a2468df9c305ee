//! Pipeline orchestration
//!
//! This module provides the public API for turning track files and live
//! samples into a [`Track`].
//!
//! Batch and live share every stage; only the driving loop differs:
//! 1. TrackFileAdapter / live schema - canonical `RawSample`s
//! 2. Kinematics - distance, elapsed time, speed, slope
//! 3. Segmentation - descent runs
//! 4. StatsAggregator - whole-track statistics
//! 5. Analytics / ReportEncoder - on demand

use crate::adapters::{adapter_for, TrackFileAdapter};
use crate::aggregator::StatsAggregator;
use crate::analytics::{self, Analytics};
use crate::config::EngineConfig;
use crate::encoder::ReportEncoder;
use crate::error::EngineError;
use crate::kinematics::Kinematics;
use crate::segmentation::{self, Segmenter};
use crate::types::{Phase, RawSample, Run, SourceFormat, Stats, Track, TrackPoint};

/// Name given to tracks that carry none
pub const DEFAULT_TRACK_NAME: &str = "Untitled track";

/// Import a GPX document into a finished track.
///
/// # Arguments
/// * `bytes` - Complete GPX file contents
/// * `name` - Track name; falls back to the name embedded in the file
/// * `config` - Engine configuration
///
/// # Example
/// ```ignore
/// let track = gpx_to_track(&std::fs::read("morning.gpx")?, None, &EngineConfig::default())?;
/// println!("{} runs", track.runs.len());
/// ```
pub fn gpx_to_track(
    bytes: &[u8],
    name: Option<&str>,
    config: &EngineConfig,
) -> Result<Track, EngineError> {
    import_track(bytes, SourceFormat::Gpx, name, config)
}

/// Import a FIT activity into a finished track.
pub fn fit_to_track(
    bytes: &[u8],
    name: Option<&str>,
    config: &EngineConfig,
) -> Result<Track, EngineError> {
    import_track(bytes, SourceFormat::Fit, name, config)
}

/// Import a track file of the given format.
pub fn import_track(
    bytes: &[u8],
    format: SourceFormat,
    name: Option<&str>,
    config: &EngineConfig,
) -> Result<Track, EngineError> {
    let adapter = adapter_for(format)?;
    import_with_adapter(adapter.as_ref(), bytes, name, config)
}

/// Import a track file and encode the full report as JSON.
pub fn import_report_json(
    bytes: &[u8],
    format: SourceFormat,
    name: Option<&str>,
    config: &EngineConfig,
) -> Result<String, EngineError> {
    let track = import_track(bytes, format, name, config)?;
    ReportEncoder::new().encode_track_to_json(&track, &config.analytics)
}

/// Run a file through the batch pipeline.
///
/// Either the whole file becomes a track or an error is returned; no partial
/// track is ever produced.
fn import_with_adapter(
    adapter: &dyn TrackFileAdapter,
    bytes: &[u8],
    name: Option<&str>,
    config: &EngineConfig,
) -> Result<Track, EngineError> {
    // Stage 1: Decode the file into raw samples
    let parsed = adapter.parse(bytes)?;

    if let Some((index, _)) = parsed
        .samples
        .iter()
        .enumerate()
        .find(|(_, s)| !s.has_plausible_coordinates())
    {
        return Err(EngineError::MalformedInput(format!(
            "point {index} has coordinates outside WGS84 bounds"
        )));
    }

    let name = name
        .map(str::to_string)
        .or(parsed.name)
        .unwrap_or_else(|| DEFAULT_TRACK_NAME.to_string());

    let track = analyze_samples(&parsed.samples, name, adapter.format(), config);
    log::info!(
        "imported {} track '{}': {} points, {} runs",
        track.source.as_str(),
        track.name,
        track.points.len(),
        track.runs.len()
    );
    Ok(track)
}

/// Batch-process an ordered sample sequence.
pub fn analyze_samples(
    samples: &[RawSample],
    name: String,
    source: SourceFormat,
    config: &EngineConfig,
) -> Track {
    // Stage 2: Annotate kinematics
    let points = Kinematics::annotate_all(config.kinematics.clone(), samples);

    // Stage 3: Segment into runs
    let runs = segmentation::segment(&points, &config.segmentation);

    // Stage 4: Aggregate
    let stats = StatsAggregator::aggregate(&points, &runs, config.analytics.moving_speed_mps);

    Track {
        name,
        source,
        points,
        stats,
        runs,
    }
}

/// Stateful processor for live, sample-by-sample tracks.
///
/// Each push runs the sample through every stage before returning, so the
/// statistics are current after every call.
#[derive(Debug, Clone)]
pub struct TrackProcessor {
    config: EngineConfig,
    kinematics: Kinematics,
    segmenter: Segmenter,
    aggregator: StatsAggregator,
    points: Vec<TrackPoint>,
}

impl Default for TrackProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackProcessor {
    /// Create a new processor with default settings
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a processor with a specific configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            kinematics: Kinematics::new(config.kinematics.clone()),
            segmenter: Segmenter::new(config.segmentation.clone()),
            aggregator: StatsAggregator::new(config.analytics.moving_speed_mps),
            points: Vec::new(),
            config,
        }
    }

    /// Process one live sample.
    ///
    /// Returns the run closed by this sample, if any. A sample with
    /// implausible coordinates is rejected and leaves the processor untouched.
    pub fn push(&mut self, sample: &RawSample) -> Result<Option<Run>, EngineError> {
        if !sample.has_plausible_coordinates() {
            return Err(EngineError::InvalidSample(format!(
                "coordinates out of range: lat {}, lon {}",
                sample.latitude, sample.longitude
            )));
        }

        let point = self.kinematics.annotate(sample);
        let index = self.points.len();

        self.aggregator.ingest(&point, self.points.last());
        let closed = self.segmenter.push(index, &point);
        self.points.push(point);

        if let Some(run) = &closed {
            self.aggregator.close_run(run.clone());
        }
        Ok(closed)
    }

    /// Current statistics (closed runs only)
    pub fn snapshot(&self) -> Stats {
        self.aggregator.snapshot()
    }

    /// The run still being built, if the skier is descending
    pub fn open_run(&self) -> Option<Run> {
        self.segmenter.state().open_run()
    }

    pub fn phase(&self) -> Phase {
        self.segmenter.state().phase()
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    pub fn runs(&self) -> &[Run] {
        self.aggregator.runs()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Derived analytics over the points and closed runs so far
    pub fn analytics(&self) -> Analytics {
        analytics::analyze(&self.points, &self.snapshot(), &self.config.analytics)
    }

    /// Close the open run and produce the finished track.
    pub fn finish(mut self, name: String, source: SourceFormat) -> Track {
        if let Some(run) = self.segmenter.finish() {
            self.aggregator.close_run(run);
        }

        Track {
            name,
            source,
            stats: self.aggregator.snapshot(),
            runs: self.aggregator.runs().to_vec(),
            points: self.points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn descent_gpx(points: usize) -> String {
        let mut body = String::new();
        let t0 = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
        for i in 0..points {
            let lat = 46.0 + i as f64 * 8.0 / 111_195.0;
            let ele = 2500.0 - i as f64 * 2.0;
            let time = (t0 + Duration::seconds(i as i64)).to_rfc3339();
            body.push_str(&format!(
                r#"<trkpt lat="{lat}" lon="7.0"><ele>{ele}</ele><time>{time}</time></trkpt>"#
            ));
        }
        format!(
            r#"<?xml version="1.0"?><gpx version="1.1"><trk><name>Piste 4</name><trkseg>{body}</trkseg></trk></gpx>"#
        )
    }

    #[test]
    fn test_gpx_to_track() {
        let gpx = descent_gpx(80);
        let track = gpx_to_track(gpx.as_bytes(), None, &EngineConfig::default()).unwrap();

        assert_eq!(track.name, "Piste 4");
        assert_eq!(track.source, SourceFormat::Gpx);
        assert_eq!(track.points.len(), 80);
        assert_eq!(track.runs.len(), 1);
        assert_eq!(track.stats.run_count, 1);
        assert!(track.runs_are_consistent());
        assert!((track.stats.total_descent - 158.0).abs() < 1e-6);
    }

    #[test]
    fn test_explicit_name_wins() {
        let gpx = descent_gpx(5);
        let track = gpx_to_track(gpx.as_bytes(), Some("Morning"), &EngineConfig::default()).unwrap();
        assert_eq!(track.name, "Morning");
    }

    #[test]
    fn test_malformed_file_returns_no_track() {
        let result = gpx_to_track(b"<gpx><trk><trkseg>", None, &EngineConfig::default());
        assert!(matches!(result, Err(EngineError::MalformedInput(_))));

        let out_of_range = r#"<gpx><trk><trkseg><trkpt lat="95.0" lon="7.0"/></trkseg></trk></gpx>"#;
        let result = gpx_to_track(out_of_range.as_bytes(), None, &EngineConfig::default());
        assert!(matches!(result, Err(EngineError::MalformedInput(_))));
    }

    #[test]
    fn test_import_report_json() {
        let gpx = descent_gpx(60);
        let json =
            import_report_json(gpx.as_bytes(), SourceFormat::Gpx, None, &EngineConfig::default())
                .unwrap();
        let report: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(report["track"]["name"], "Piste 4");
        assert_eq!(report["stats"]["run_count"], 1);
    }

    #[test]
    fn test_processor_rejects_invalid_sample() {
        let mut processor = TrackProcessor::new();
        let t = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();

        processor.push(&RawSample::new(46.0, 7.0, t)).unwrap();
        let result = processor.push(&RawSample::new(91.0, 7.0, t + Duration::seconds(1)));

        assert!(matches!(result, Err(EngineError::InvalidSample(_))));
        assert_eq!(processor.points().len(), 1);
        processor
            .push(&RawSample::new(46.0001, 7.0, t + Duration::seconds(2)))
            .unwrap();
        assert_eq!(processor.points().len(), 2);
    }

    #[test]
    fn test_processor_snapshot_and_finish() {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
        let mut processor = TrackProcessor::new();
        for i in 0..60 {
            let mut s = RawSample::new(
                46.0 + i as f64 * 8.0 / 111_195.0,
                7.0,
                t0 + Duration::seconds(i),
            );
            s.elevation = Some(2500.0 - i as f64 * 2.0);
            processor.push(&s).unwrap();
        }

        // The descent is still open while recording
        assert_eq!(processor.snapshot().run_count, 0);
        assert_eq!(processor.phase(), Phase::Descending);
        assert!(processor.open_run().is_some());

        let track = processor.finish("Live".to_string(), SourceFormat::Live);
        assert_eq!(track.runs.len(), 1);
        assert_eq!(track.stats.run_count, 1);
        assert!(track.stats.ski_distance <= track.stats.total_distance);
    }
}
