//! Recording session state machine
//!
//! ```text
//! Idle -> Acquiring -> Recording <-> Paused
//!   ^         |            |            |
//!   +---------+            +--> Stopped <+
//! (process start) Recovered -> Recording | Stopped
//! ```
//!
//! A [`RecordingSession`] owns one live capture: it feeds every accepted fix
//! through a [`TrackProcessor`] and appends the raw sample to a checkpoint log
//! that is flushed by count or by age. Time always comes from the caller
//! (sample timestamps and `now` arguments), never from a wall clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::{CheckpointLog, CheckpointMeta, CheckpointStore, LoadedCheckpoint};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::kinematics::seconds_between;
use crate::pipeline::TrackProcessor;
use crate::schema::{HeartRateReading, LocationFix};
use crate::types::{RawSample, Run, SourceFormat, Stats, Track};

/// Lifecycle state of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Acquiring,
    Recording,
    Paused,
    Stopped,
    Recovered,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::Recovered => "recovered",
        }
    }

    /// States that hold a live track and checkpoint
    fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Recording | SessionState::Paused | SessionState::Recovered
        )
    }
}

/// Location permission as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

/// Permission/location collaborator
pub trait LocationAuthority {
    /// Current permission; the host may prompt the user before answering
    fn permission_status(&mut self) -> PermissionStatus;

    /// Obtain the foreground-capture guarantee (service, notification, ...)
    fn acquire_foreground(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Give the foreground guarantee back
    fn release_foreground(&mut self) {}
}

/// Authority for hosts that have already settled permission
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantedAuthority;

impl LocationAuthority for GrantedAuthority {
    fn permission_status(&mut self) -> PermissionStatus {
        PermissionStatus::Granted
    }
}

/// Non-fatal condition the host should surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionWarning {
    CheckpointFailing { consecutive_failures: u32 },
}

/// What a persisted checkpoint holds, without replaying it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub session_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub point_count: usize,
    pub elapsed_secs: f64,
    pub last_sample_at: Option<DateTime<Utc>>,
}

impl RecoveryInfo {
    fn from_checkpoint(loaded: &LoadedCheckpoint) -> Self {
        Self {
            session_id: loaded.meta.session_id.clone(),
            name: loaded.meta.name.clone(),
            started_at: loaded.meta.started_at,
            point_count: loaded.samples.len(),
            elapsed_secs: loaded.meta.elapsed_secs,
            last_sample_at: loaded.samples.last().map(|s| s.timestamp),
        }
    }
}

/// Result of handing a location fix to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// The fix became a track point; carries the run it closed, if any
    Recorded { closed_run: Option<Run> },
    /// The fix was valid but not recorded (paused, poor first fix, recovered)
    Ignored,
}

/// One live recording
pub struct RecordingSession<S: CheckpointStore> {
    config: EngineConfig,
    store: S,
    authority: Box<dyn LocationAuthority>,
    state: SessionState,
    session_id: Option<String>,
    name: String,
    started_at: Option<DateTime<Utc>>,
    acquiring_since: Option<DateTime<Utc>>,
    elapsed_secs: f64,
    /// Last time recording time was accounted up to
    clock: Option<DateTime<Utc>>,
    processor: Option<TrackProcessor>,
    log: Option<CheckpointLog>,
    /// Samples not yet flushed to the checkpoint
    buffer: Vec<RawSample>,
    last_location: Option<LocationFix>,
    last_heart_rate: Option<HeartRateReading>,
    consecutive_flush_failures: u32,
    warning: Option<SessionWarning>,
    last_error: Option<String>,
}

impl<S: CheckpointStore> RecordingSession<S> {
    pub fn new(store: S, authority: Box<dyn LocationAuthority>, config: EngineConfig) -> Self {
        Self {
            config,
            store,
            authority,
            state: SessionState::Idle,
            session_id: None,
            name: String::new(),
            started_at: None,
            acquiring_since: None,
            elapsed_secs: 0.0,
            clock: None,
            processor: None,
            log: None,
            buffer: Vec::new(),
            last_location: None,
            last_heart_rate: None,
            consecutive_flush_failures: 0,
            warning: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Seconds spent in `Recording`
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs
    }

    pub fn warning(&self) -> Option<&SessionWarning> {
        self.warning.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_location(&self) -> Option<&LocationFix> {
        self.last_location.as_ref()
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    /// The checkpoint as last written
    pub fn checkpoint_meta(&self) -> Option<&CheckpointMeta> {
        self.log.as_ref().map(|log| log.meta())
    }

    /// Live track state
    pub fn processor(&self) -> Option<&TrackProcessor> {
        self.processor.as_ref()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.processor.as_ref().map(|p| p.snapshot())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Report a recoverable checkpoint, if one exists.
    ///
    /// A checkpoint that cannot be read is logged and reported as absent.
    pub fn check_for_recovery(&self) -> Option<RecoveryInfo> {
        match CheckpointLog::load(&self.store) {
            Ok(Some(loaded)) => Some(RecoveryInfo::from_checkpoint(&loaded)),
            Ok(None) => None,
            Err(e) => {
                log::warn!("ignoring unreadable recording checkpoint: {e}");
                None
            }
        }
    }

    /// Rebuild the interrupted recording by replaying its checkpoint.
    pub fn recover_recording(&mut self) -> Result<Stats, EngineError> {
        self.require(
            "recover recording",
            matches!(self.state, SessionState::Idle | SessionState::Stopped),
        )?;

        let loaded = CheckpointLog::load(&self.store)?.ok_or_else(|| {
            EngineError::RecoveryCorrupt("no recoverable session".to_string())
        })?;

        let mut processor = TrackProcessor::with_config(self.config.clone());
        for sample in &loaded.samples {
            processor.push(sample).map_err(|e| {
                EngineError::RecoveryCorrupt(format!("checkpoint holds an invalid sample: {e}"))
            })?;
        }

        let stats = processor.snapshot();
        log::info!(
            "recovered recording '{}' ({} points, {} runs)",
            loaded.meta.name,
            loaded.samples.len(),
            stats.run_count
        );

        self.reset();
        self.session_id = Some(loaded.meta.session_id.clone());
        self.name = loaded.meta.name.clone();
        self.started_at = Some(loaded.meta.started_at);
        self.elapsed_secs = loaded.meta.elapsed_secs;
        self.processor = Some(processor);
        self.log = Some(CheckpointLog::resume(
            loaded.meta,
            self.config.session.compact_after_segments,
        ));
        self.state = SessionState::Recovered;
        Ok(stats)
    }

    /// Throw away a persisted checkpoint without replaying it.
    pub fn clear_recovery(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Idle | SessionState::Stopped => {
                CheckpointLog::clear(&mut self.store)?;
                log::info!("recording checkpoint cleared");
                Ok(())
            }
            SessionState::Recovered => self.discard_recording(),
            _ => Err(self.invalid("clear recovery")),
        }
    }

    /// Begin acquiring a first fix for a new recording.
    pub fn start_recording(&mut self, name: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.require(
            "start recording",
            matches!(self.state, SessionState::Idle | SessionState::Stopped),
        )?;

        match CheckpointLog::load(&self.store) {
            Ok(Some(_)) => return Err(EngineError::RecoveryPending),
            Ok(None) => {}
            Err(e) => {
                log::warn!("discarding unreadable checkpoint before new recording: {e}");
                CheckpointLog::clear(&mut self.store)?;
            }
        }

        self.reset();
        self.state = SessionState::Idle;

        let permission = self.authority.permission_status();
        if permission != PermissionStatus::Granted {
            log::warn!("location permission {permission:?}; recording not started");
            return Err(self.fail(EngineError::PermissionDenied));
        }

        self.session_id = Some(Uuid::new_v4().to_string());
        self.name = name.to_string();
        self.started_at = Some(now);
        self.acquiring_since = Some(now);
        self.state = SessionState::Acquiring;
        log::info!("acquiring location for '{name}'");
        Ok(())
    }

    /// Hand a location fix to the session.
    ///
    /// An invalid fix is rejected with `InvalidSample` and the session carries
    /// on as if it never arrived.
    pub fn on_location(&mut self, fix: LocationFix) -> Result<SampleOutcome, EngineError> {
        if let Err(e) = fix.validate() {
            log::warn!("dropping location fix at {}: {e}", fix.timestamp);
            return Err(e.into());
        }

        match self.state {
            SessionState::Acquiring => self.on_acquiring_fix(fix),
            SessionState::Recording => self.record(fix),
            SessionState::Paused | SessionState::Recovered => {
                self.last_location = Some(fix);
                Ok(SampleOutcome::Ignored)
            }
            SessionState::Idle | SessionState::Stopped => Err(self.invalid("accept location")),
        }
    }

    /// Remember a heart-rate reading for the next fix.
    pub fn on_heart_rate(&mut self, reading: HeartRateReading) -> Result<(), EngineError> {
        reading.validate()?;
        self.last_heart_rate = Some(reading);
        Ok(())
    }

    /// Advance time without a fix: acquisition timeout, recording clock and
    /// time-based flushes.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        match self.state {
            SessionState::Acquiring => self.check_acquisition_timeout(now),
            SessionState::Recording => {
                self.advance_clock(now);
                self.maybe_flush(now);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn pause_recording(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.require("pause", self.state == SessionState::Recording)?;
        self.advance_clock(now);
        self.flush_checkpoint();
        self.clock = None;
        self.state = SessionState::Paused;
        log::info!("recording paused after {:.0}s", self.elapsed_secs);
        Ok(())
    }

    /// Continue a paused or recovered recording.
    pub fn resume_recording(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.require(
            "resume",
            matches!(self.state, SessionState::Paused | SessionState::Recovered),
        )?;
        if self.state == SessionState::Recovered {
            if let Err(e) = self.authority.acquire_foreground() {
                return Err(self.fail(e));
            }
        }
        self.clock = Some(now);
        self.state = SessionState::Recording;
        log::info!("recording resumed");
        Ok(())
    }

    /// Finish the recording and clear its checkpoint.
    ///
    /// Safe in any state; returns `None` when there was nothing to finish.
    pub fn stop_recording(&mut self, now: DateTime<Utc>) -> Result<Option<Track>, EngineError> {
        match self.state {
            SessionState::Idle | SessionState::Stopped => return Ok(None),
            SessionState::Acquiring => {
                self.reset();
                self.state = SessionState::Idle;
                log::info!("acquisition cancelled");
                return Ok(None);
            }
            _ => {}
        }

        self.advance_clock(now);
        let processor = self.processor.take().unwrap_or_default();
        let track = processor.finish(self.name.clone(), SourceFormat::Live);

        if let Err(e) = CheckpointLog::clear(&mut self.store) {
            log::warn!("could not clear checkpoint after stop: {e}");
            self.last_error = Some(e.to_string());
        }
        self.authority.release_foreground();
        self.log = None;
        self.buffer.clear();
        self.clock = None;
        self.state = SessionState::Stopped;
        log::info!(
            "recording '{}' stopped: {} points, {} runs",
            track.name,
            track.points.len(),
            track.runs.len()
        );
        Ok(Some(track))
    }

    /// Drop the recording and its checkpoint without producing a track.
    ///
    /// A no-op when nothing is being recorded.
    pub fn discard_recording(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Idle | SessionState::Stopped => return Ok(()),
            SessionState::Acquiring => {}
            _ => CheckpointLog::clear(&mut self.store)?,
        }
        if self.state.is_active() {
            self.authority.release_foreground();
        }
        self.reset();
        self.state = SessionState::Idle;
        log::info!("recording discarded");
        Ok(())
    }

    /// Write buffered samples and the elapsed time to the checkpoint now.
    ///
    /// Returns false if the write failed; the samples stay buffered for the
    /// next attempt and recording continues.
    pub fn flush_checkpoint(&mut self) -> bool {
        let result = if self.buffer.is_empty() {
            self.touch_log()
        } else {
            self.append_buffer()
        };

        match result {
            Ok(()) => {
                if !self.buffer.is_empty() {
                    log::debug!("flushed {} samples to checkpoint", self.buffer.len());
                }
                self.buffer.clear();
                self.consecutive_flush_failures = 0;
                self.warning = None;
                true
            }
            Err(e) => {
                self.consecutive_flush_failures += 1;
                log::warn!(
                    "checkpoint flush failed ({} in a row): {e}",
                    self.consecutive_flush_failures
                );
                self.last_error = Some(e.to_string());
                if self.consecutive_flush_failures >= self.config.session.max_consecutive_flush_failures {
                    self.warning = Some(SessionWarning::CheckpointFailing {
                        consecutive_failures: self.consecutive_flush_failures,
                    });
                }
                false
            }
        }
    }

    fn append_buffer(&mut self) -> Result<(), EngineError> {
        if self.log.is_none() {
            self.log = Some(self.create_log()?);
        }
        match self.log.as_mut() {
            Some(log) => log.append(&mut self.store, &self.buffer, self.elapsed_secs),
            None => Ok(()),
        }
    }

    /// Persist elapsed time accrued since the last write, if any
    fn touch_log(&mut self) -> Result<(), EngineError> {
        match self.log.as_mut() {
            Some(log) if log.meta().elapsed_secs != self.elapsed_secs => {
                log.touch(&mut self.store, self.elapsed_secs)
            }
            _ => Ok(()),
        }
    }

    fn on_acquiring_fix(&mut self, fix: LocationFix) -> Result<SampleOutcome, EngineError> {
        self.check_acquisition_timeout(fix.timestamp)?;

        let usable = fix
            .accuracy
            .map_or(true, |a| a <= self.config.session.acquisition_accuracy_m);
        if !usable {
            log::debug!("waiting for a better first fix ({:?} m)", fix.accuracy);
            self.last_location = Some(fix);
            return Ok(SampleOutcome::Ignored);
        }

        if let Err(e) = self.authority.acquire_foreground() {
            return Err(self.fail(e));
        }

        self.processor = Some(TrackProcessor::with_config(self.config.clone()));
        self.acquiring_since = None;
        self.clock = Some(fix.timestamp);
        self.state = SessionState::Recording;
        log::info!("first fix acquired; recording '{}'", self.name);

        match self.create_log() {
            Ok(log) => self.log = Some(log),
            Err(e) => log::warn!("could not create checkpoint, will retry on flush: {e}"),
        }

        self.record(fix)
    }

    fn record(&mut self, mut fix: LocationFix) -> Result<SampleOutcome, EngineError> {
        if fix.heart_rate.is_none() {
            fix.heart_rate = self.fresh_heart_rate(fix.timestamp);
        }
        let sample = fix.to_raw_sample();

        let processor = self
            .processor
            .get_or_insert_with(|| TrackProcessor::with_config(self.config.clone()));
        let closed_run = processor.push(&sample)?;

        self.advance_clock(fix.timestamp);
        self.buffer.push(sample);
        self.last_location = Some(fix.clone());
        self.maybe_flush(fix.timestamp);

        Ok(SampleOutcome::Recorded { closed_run })
    }

    fn fresh_heart_rate(&self, at: DateTime<Utc>) -> Option<f64> {
        let reading = self.last_heart_rate.as_ref()?;
        let age = seconds_between(reading.timestamp, at).abs();
        (age <= self.config.session.heart_rate_max_age_secs as f64).then_some(reading.bpm)
    }

    fn check_acquisition_timeout(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let since = match self.acquiring_since {
            Some(since) => since,
            None => return Ok(()),
        };
        let timeout = self.config.session.acquisition_timeout_secs;
        if (now - since).num_seconds() > timeout {
            log::warn!("no usable fix after {timeout}s; back to idle");
            self.reset();
            self.state = SessionState::Idle;
            return Err(self.fail(EngineError::AcquisitionTimeout {
                waited_secs: timeout,
            }));
        }
        Ok(())
    }

    fn maybe_flush(&mut self, now: DateTime<Utc>) {
        let interval = self.config.session.flush_interval_secs;
        let due = match self.buffer.first() {
            Some(oldest) => {
                self.buffer.len() >= self.config.session.flush_every_points.max(1)
                    || (now - oldest.timestamp).num_seconds() >= interval
            }
            // Nothing buffered: only the clock has moved
            None => self
                .log
                .as_ref()
                .map_or(false, |log| self.elapsed_secs - log.meta().elapsed_secs >= interval as f64),
        };
        if due {
            self.flush_checkpoint();
        }
    }

    fn advance_clock(&mut self, now: DateTime<Utc>) {
        if self.state != SessionState::Recording {
            return;
        }
        if let Some(last) = self.clock {
            let delta = seconds_between(last, now);
            if delta > 0.0 {
                self.elapsed_secs += delta;
                self.clock = Some(now);
            }
        } else {
            self.clock = Some(now);
        }
    }

    fn create_log(&mut self) -> Result<CheckpointLog, EngineError> {
        let session_id = self.session_id.clone().unwrap_or_default();
        let started_at = self.started_at.unwrap_or_default();
        CheckpointLog::create(
            &mut self.store,
            session_id,
            self.name.clone(),
            started_at,
            self.config.session.compact_after_segments,
        )
    }

    fn reset(&mut self) {
        self.session_id = None;
        self.name.clear();
        self.started_at = None;
        self.acquiring_since = None;
        self.elapsed_secs = 0.0;
        self.clock = None;
        self.processor = None;
        self.log = None;
        self.buffer.clear();
        self.last_heart_rate = None;
        self.consecutive_flush_failures = 0;
        self.warning = None;
    }

    fn require(&self, operation: &'static str, allowed: bool) -> Result<(), EngineError> {
        if allowed {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    fn fail(&mut self, error: EngineError) -> EngineError {
        self.last_error = Some(error.to_string());
        error
    }
}
