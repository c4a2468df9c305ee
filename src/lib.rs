//! Ski Telemetry - on-device engine for ski GPS tracks
//!
//! The engine turns GPS position streams (imported GPX/FIT files or a live
//! location feed) into per-point kinematics, descent runs and whole-track
//! statistics through a deterministic pipeline: format adaptation → kinematics
//! → run segmentation → aggregation → report encoding.
//!
//! ## Modules
//!
//! - **Batch import**: decode a complete GPX or FIT file into a finished [`Track`]
//! - **Live recording**: a [`RecordingSession`] drives a [`TrackProcessor`] one
//!   fix at a time and keeps a crash-recoverable checkpoint
//! - **Analytics**: speed distribution, heart-rate zones and a performance score

pub mod adapters;
pub mod aggregator;
pub mod analytics;
pub mod checkpoint;
pub mod config;
pub mod encoder;
pub mod error;
pub mod kinematics;
pub mod pipeline;
pub mod schema;
pub mod segmentation;
pub mod session;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::EngineConfig;
pub use encoder::{LiveSnapshot, ReportEncoder, TrackReport};
pub use error::EngineError;
pub use pipeline::{fit_to_track, gpx_to_track, import_track, TrackProcessor};
pub use session::{
    LocationAuthority, PermissionStatus, RecordingSession, RecoveryInfo, SessionState,
    SessionWarning,
};
pub use types::{Phase, RawSample, Run, SourceFormat, Stats, Track, TrackPoint};

// Schema exports
pub use schema::{LiveEvent, LiveEventAdapter, SCHEMA_VERSION};

/// Engine version embedded in every report
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for reports
pub const PRODUCER_NAME: &str = "ski-telemetry";
