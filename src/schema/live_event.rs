//! ski.live_sample.v1 event definitions

use crate::types::RawSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version
pub const SCHEMA_VERSION: &str = "ski.live_sample.v1";

/// Physiologically plausible heart rate range (bpm)
const HEART_RATE_RANGE: (f64, f64) = (20.0, 260.0);

/// One event from a live sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveEvent {
    /// A position fix from the location provider
    Location(LocationFix),
    /// A heart-rate reading from a paired strap or watch
    HeartRate(HeartRateReading),
}

impl LiveEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LiveEvent::Location(fix) => fix.timestamp,
            LiveEvent::HeartRate(reading) => reading.timestamp,
        }
    }

    /// Validate the event against the schema's plausibility rules
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            LiveEvent::Location(fix) => fix.validate(),
            LiveEvent::HeartRate(reading) => reading.validate(),
        }
    }
}

/// Position fix payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub timestamp: DateTime<Utc>,
    /// Latitude (degrees)
    pub latitude: f64,
    /// Longitude (degrees)
    pub longitude: f64,
    /// Elevation (meters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    /// Speed reported by the provider (m/s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Horizontal accuracy radius (meters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Heart rate bundled with the fix, when the device provides both
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
}

impl LocationFix {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            elevation: None,
            speed: None,
            accuracy: None,
            heart_rate: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.latitude.is_finite()
            || !self.longitude.is_finite()
            || self.latitude.abs() > 90.0
            || self.longitude.abs() > 180.0
        {
            return Err(ValidationError::CoordinatesOutOfRange {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }

        for (field, value) in [
            ("elevation", self.elevation),
            ("speed", self.speed),
            ("accuracy", self.accuracy),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(ValidationError::NonFinite { field });
                }
            }
        }

        if let Some(accuracy) = self.accuracy {
            if accuracy < 0.0 {
                return Err(ValidationError::Negative {
                    field: "accuracy",
                    value: accuracy,
                });
            }
        }

        if let Some(bpm) = self.heart_rate {
            validate_heart_rate(bpm)?;
        }

        Ok(())
    }

    /// Convert to the pipeline's raw sample
    pub fn to_raw_sample(&self) -> RawSample {
        RawSample {
            latitude: self.latitude,
            longitude: self.longitude,
            elevation: self.elevation,
            timestamp: self.timestamp,
            speed: self.speed,
            heart_rate: self.heart_rate,
            accuracy: self.accuracy,
        }
    }
}

/// Heart-rate payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateReading {
    pub timestamp: DateTime<Utc>,
    pub bpm: f64,
}

impl HeartRateReading {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_heart_rate(self.bpm)
    }
}

fn validate_heart_rate(bpm: f64) -> Result<(), ValidationError> {
    if !bpm.is_finite() || bpm < HEART_RATE_RANGE.0 || bpm > HEART_RATE_RANGE.1 {
        return Err(ValidationError::HeartRateOutOfRange { bpm });
    }
    Ok(())
}

/// Validation errors for live events
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Coordinates out of range: lat {latitude}, lon {longitude}")]
    CoordinatesOutOfRange { latitude: f64, longitude: f64 },

    #[error("Field {field} is not a finite number")]
    NonFinite { field: &'static str },

    #[error("Field {field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("Heart rate {bpm} bpm is outside the plausible range")]
    HeartRateOutOfRange { bpm: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_deserialize_location_event() {
        let json = r#"{
            "kind": "location",
            "timestamp": "2024-02-10T10:00:00Z",
            "latitude": 46.55,
            "longitude": 7.98,
            "elevation": 2200.5,
            "accuracy": 4.0
        }"#;

        let event: LiveEvent = serde_json::from_str(json).unwrap();
        match &event {
            LiveEvent::Location(fix) => {
                assert_eq!(fix.elevation, Some(2200.5));
                assert_eq!(fix.speed, None);
            }
            other => panic!("Expected location, got {other:?}"),
        }
        assert_eq!(event.timestamp(), t0());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_deserialize_heart_rate_event() {
        let json = r#"{"kind":"heart_rate","timestamp":"2024-02-10T10:00:00Z","bpm":142}"#;
        let event: LiveEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            LiveEvent::HeartRate(HeartRateReading {
                timestamp: t0(),
                bpm: 142.0
            })
        );
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        let fix = LocationFix::new(t0(), 91.0, 7.0);
        assert!(matches!(
            fix.validate(),
            Err(ValidationError::CoordinatesOutOfRange { .. })
        ));

        let fix = LocationFix::new(t0(), 45.0, 181.0);
        assert!(fix.validate().is_err());
    }

    #[test]
    fn test_implausible_heart_rate_rejected() {
        let reading = HeartRateReading {
            timestamp: t0(),
            bpm: 400.0,
        };
        assert_eq!(
            reading.validate(),
            Err(ValidationError::HeartRateOutOfRange { bpm: 400.0 })
        );
    }

    #[test]
    fn test_to_raw_sample() {
        let mut fix = LocationFix::new(t0(), 46.0, 7.0);
        fix.heart_rate = Some(130.0);
        let raw = fix.to_raw_sample();
        assert_eq!(raw.heart_rate, Some(130.0));
        assert_eq!(raw.timestamp, t0());
    }
}
