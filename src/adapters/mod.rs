//! Track file adapters
//!
//! This module provides adapters that decode a complete track file and map it
//! to the canonical raw sample sequence. Adapters are the only code that knows
//! about format differences; everything downstream sees `RawSample`.

mod fit;
mod gpx;

pub use fit::FitAdapter;
pub use gpx::GpxAdapter;

use crate::error::EngineError;
use crate::types::{RawSample, SourceFormat};

/// Samples decoded from one track file, in file order
#[derive(Debug, Clone, Default)]
pub struct ParsedTrack {
    /// Track name embedded in the file, if any
    pub name: Option<String>,
    pub samples: Vec<RawSample>,
}

/// Trait for track file adapters
pub trait TrackFileAdapter {
    /// The format this adapter decodes
    fn format(&self) -> SourceFormat;

    /// Decode a complete file buffer into raw samples
    fn parse(&self, bytes: &[u8]) -> Result<ParsedTrack, EngineError>;
}

/// Get the adapter for a file format
pub fn adapter_for(format: SourceFormat) -> Result<Box<dyn TrackFileAdapter>, EngineError> {
    match format {
        SourceFormat::Gpx => Ok(Box::new(GpxAdapter)),
        SourceFormat::Fit => Ok(Box::new(FitAdapter)),
        SourceFormat::Live => Err(EngineError::UnsupportedFormat(
            "live samples are not a file format".to_string(),
        )),
    }
}

/// Parse a user-supplied format name ("gpx", "fit")
pub fn parse_format_name(name: &str) -> Result<SourceFormat, EngineError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "gpx" => Ok(SourceFormat::Gpx),
        "fit" => Ok(SourceFormat::Fit),
        other => Err(EngineError::UnsupportedFormat(other.to_string())),
    }
}

/// Guess a file's format from its name, falling back to its content
pub fn detect_format(file_name: &str, bytes: &[u8]) -> Option<SourceFormat> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".gpx") {
        return Some(SourceFormat::Gpx);
    }
    if lower.ends_with(".fit") {
        return Some(SourceFormat::Fit);
    }

    // FIT files carry ".FIT" at bytes 8..12 of the header
    if bytes.len() >= 12 && &bytes[8..12] == b".FIT" {
        return Some(SourceFormat::Fit);
    }

    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'<') {
        return Some(SourceFormat::Gpx);
    }

    None
}
