//! Error types for the ski telemetry engine

use thiserror::Error;

/// Errors surfaced by ingestion, the recording session and persistence
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("No usable GPS fix after {waited_secs}s")]
    AcquisitionTimeout { waited_secs: i64 },

    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("Recovery checkpoint is corrupt: {0}")]
    RecoveryCorrupt(String),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("A recoverable recording exists; recover or clear it first")]
    RecoveryPending,

    #[error("Unsupported track format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<crate::schema::ValidationError> for EngineError {
    fn from(e: crate::schema::ValidationError) -> Self {
        EngineError::InvalidSample(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::AcquisitionTimeout { waited_secs: 60 };
        assert_eq!(err.to_string(), "No usable GPS fix after 60s");

        let err = EngineError::InvalidState {
            operation: "pause",
            state: "idle",
        };
        assert!(err.to_string().contains("pause"));
        assert!(err.to_string().contains("idle"));
    }
}
