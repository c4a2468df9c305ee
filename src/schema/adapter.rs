//! Parsing and batch validation of live event streams

use crate::error::EngineError;
use crate::schema::live_event::*;

/// Adapter for reading live events from JSON text
pub struct LiveEventAdapter;

impl LiveEventAdapter {
    /// Parse a JSON string containing an array of LiveEvents
    pub fn parse_array(json: &str) -> Result<Vec<LiveEvent>, EngineError> {
        let events: Vec<LiveEvent> = serde_json::from_str(json)?;
        Ok(events)
    }

    /// Parse NDJSON (newline-delimited JSON) containing LiveEvents
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<LiveEvent>, EngineError> {
        let mut events = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            events.push(Self::parse_line(trimmed).map_err(|e| {
                EngineError::MalformedInput(format!("line {}: {}", line_num + 1, e))
            })?);
        }
        Ok(events)
    }

    /// Parse a single NDJSON line
    pub fn parse_line(line: &str) -> Result<LiveEvent, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Validate a batch of events, returning only the failures
    pub fn validate_events(events: &[LiveEvent]) -> Vec<ValidationResult> {
        events
            .iter()
            .enumerate()
            .filter_map(|(index, event)| {
                event.validate().err().map(|error| ValidationResult {
                    index,
                    timestamp: event.timestamp(),
                    error,
                })
            })
            .collect()
    }
}

/// A failed validation for one event in a batch
#[derive(Debug)]
pub struct ValidationResult {
    pub index: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub error: ValidationError,
}
