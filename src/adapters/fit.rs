//! FIT activity adapter
//!
//! Decodes `record` messages with fitparser. Positions are stored in
//! semicircles; enhanced altitude and speed fields win over the legacy ones
//! when both are present. Records without a position or a timestamp (sensor
//! only samples, indoor laps) are skipped.

use chrono::{DateTime, Utc};
use fitparser::de::from_bytes;
use fitparser::profile::MesgNum;

use super::{ParsedTrack, TrackFileAdapter};
use crate::error::EngineError;
use crate::types::{RawSample, SourceFormat};

/// Degrees per semicircle (180 / 2^31)
const SEMICIRCLE_TO_DEGREES: f64 = 180.0 / 2_147_483_648.0;

/// FIT file adapter
pub struct FitAdapter;

impl TrackFileAdapter for FitAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Fit
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedTrack, EngineError> {
        parse_fit(bytes)
    }
}

/// Fields collected from one record message
#[derive(Debug, Default)]
struct FitRecord {
    timestamp: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
    altitude: Option<f64>,
    enhanced_altitude: Option<f64>,
    speed: Option<f64>,
    enhanced_speed: Option<f64>,
    heart_rate: Option<f64>,
}

impl FitRecord {
    fn into_sample(self) -> Option<RawSample> {
        Some(RawSample {
            latitude: self.lat?,
            longitude: self.lon?,
            elevation: self.enhanced_altitude.or(self.altitude),
            timestamp: self.timestamp?,
            speed: self.enhanced_speed.or(self.speed),
            heart_rate: self.heart_rate,
            accuracy: None,
        })
    }
}

/// Decode a FIT buffer into raw samples.
pub fn parse_fit(bytes: &[u8]) -> Result<ParsedTrack, EngineError> {
    let messages = from_bytes(bytes)
        .map_err(|e| EngineError::MalformedInput(format!("FIT decode error: {e}")))?;

    let mut samples = Vec::new();
    let mut skipped = 0usize;

    for message in messages.into_iter() {
        if message.kind() != MesgNum::Record {
            continue;
        }

        let mut record = FitRecord::default();
        for field in message.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        record.timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                "position_lat" => record.lat = semicircles_to_degrees(field.value()),
                "position_long" => record.lon = semicircles_to_degrees(field.value()),
                "altitude" => record.altitude = fit_value_to_f64(field.value()),
                "enhanced_altitude" => record.enhanced_altitude = fit_value_to_f64(field.value()),
                "speed" => record.speed = fit_value_to_f64(field.value()),
                "enhanced_speed" => record.enhanced_speed = fit_value_to_f64(field.value()),
                "heart_rate" => record.heart_rate = fit_value_to_f64(field.value()),
                _ => {}
            }
        }

        match record.into_sample() {
            Some(sample) => samples.push(sample),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        log::debug!("skipped {skipped} FIT records without position or timestamp");
    }

    if samples.is_empty() {
        return Err(EngineError::MalformedInput(
            "FIT file contains no positioned records".to_string(),
        ));
    }

    Ok(ParsedTrack {
        name: None,
        samples,
    })
}

fn semicircles_to_degrees(value: &fitparser::Value) -> Option<f64> {
    fit_value_to_f64(value).map(semicircles_value_to_degrees)
}

fn semicircles_value_to_degrees(semicircles: f64) -> f64 {
    semicircles * SEMICIRCLE_TO_DEGREES
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    let v = match value {
        fitparser::Value::Float32(v) => *v as f64,
        fitparser::Value::Float64(v) => *v,
        fitparser::Value::SInt8(v) => *v as f64,
        fitparser::Value::SInt16(v) => *v as f64,
        fitparser::Value::SInt32(v) => *v as f64,
        fitparser::Value::SInt64(v) => *v as f64,
        fitparser::Value::UInt8(v) => *v as f64,
        fitparser::Value::UInt8z(v) => *v as f64,
        fitparser::Value::UInt16(v) => *v as f64,
        fitparser::Value::UInt16z(v) => *v as f64,
        fitparser::Value::UInt32(v) => *v as f64,
        fitparser::Value::UInt32z(v) => *v as f64,
        fitparser::Value::UInt64(v) => *v as f64,
        fitparser::Value::UInt64z(v) => *v as f64,
        fitparser::Value::Byte(v) => *v as f64,
        fitparser::Value::Array(values) => return values.iter().find_map(fit_value_to_f64),
        _ => return None,
    };
    v.is_finite().then_some(v)
}
