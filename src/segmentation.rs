//! Run segmentation
//!
//! Splits the annotated point stream into descending, ascending and stationary
//! phases and turns qualifying descents into [`Run`]s.
//!
//! - Each point is classified from a rolling window (net elevation rate and
//!   mean speed over the last `window_samples` point pairs), never from a
//!   single-sample slope.
//! - A phase change is accepted only after the new class holds for
//!   `sustain_samples` consecutive points.
//! - While a run is open, points after its last descending point collect in a
//!   tail. Descent that resumes within `max_merge_gap_secs` folds the tail back
//!   into the run; a longer gap closes it.
//! - A closed run is kept only if both its distance and vertical drop reach
//!   the configured minimums.
//!
//! The state machine is a pure transition, [`advance`]; [`segment`] folds it
//! over a finished track and [`Segmenter`] drives it one point at a time. Work
//! per point is bounded by the window size.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::SegmentationConfig;
use crate::kinematics::seconds_between;
use crate::types::{Phase, Run, TrackPoint};

#[derive(Debug, Clone)]
struct WindowEntry {
    timestamp: DateTime<Utc>,
    elevation: Option<f64>,
    speed: f64,
}

/// Running totals for a contiguous point range
#[derive(Debug, Clone)]
struct RunAccumulator {
    start_index: usize,
    end_index: usize,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    start_elevation: Option<f64>,
    end_elevation: Option<f64>,
    distance: f64,
    speed_sum: f64,
    speed_count: usize,
    max_speed: f64,
    hr_sum: f64,
    hr_count: usize,
    max_hr: Option<f64>,
}

impl RunAccumulator {
    fn begin(index: usize, point: &TrackPoint) -> Self {
        let mut acc = Self {
            start_index: index,
            end_index: index,
            start_time: point.timestamp,
            end_time: point.timestamp,
            start_elevation: point.elevation,
            end_elevation: point.elevation,
            distance: 0.0,
            speed_sum: 0.0,
            speed_count: 0,
            max_speed: 0.0,
            hr_sum: 0.0,
            hr_count: 0,
            max_hr: None,
        };
        acc.add_heart_rate(point.heart_rate);
        acc
    }

    /// An empty range anchored at the end of `run`
    fn tail_of(run: &RunAccumulator) -> Self {
        Self {
            start_index: run.end_index,
            end_index: run.end_index,
            start_time: run.end_time,
            end_time: run.end_time,
            start_elevation: run.end_elevation,
            end_elevation: run.end_elevation,
            distance: 0.0,
            speed_sum: 0.0,
            speed_count: 0,
            max_speed: 0.0,
            hr_sum: 0.0,
            hr_count: 0,
            max_hr: None,
        }
    }

    fn push(&mut self, index: usize, point: &TrackPoint) {
        self.end_index = index;
        self.end_time = point.timestamp;
        if let Some(elevation) = point.elevation {
            self.end_elevation = Some(elevation);
            if self.start_elevation.is_none() {
                self.start_elevation = Some(elevation);
            }
        }
        self.distance += point.distance;
        self.speed_sum += point.speed;
        self.speed_count += 1;
        self.max_speed = self.max_speed.max(point.speed);
        self.add_heart_rate(point.heart_rate);
    }

    /// Extend this range with a tail that starts where it ends.
    fn absorb(&mut self, tail: RunAccumulator) {
        if tail.end_index <= self.end_index {
            return;
        }
        self.end_index = tail.end_index;
        self.end_time = tail.end_time;
        if tail.end_elevation.is_some() {
            self.end_elevation = tail.end_elevation;
        }
        self.distance += tail.distance;
        self.speed_sum += tail.speed_sum;
        self.speed_count += tail.speed_count;
        self.max_speed = self.max_speed.max(tail.max_speed);
        self.hr_sum += tail.hr_sum;
        self.hr_count += tail.hr_count;
        self.max_hr = match (self.max_hr, tail.max_hr) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn add_heart_rate(&mut self, heart_rate: Option<f64>) {
        if let Some(hr) = heart_rate {
            self.hr_sum += hr;
            self.hr_count += 1;
            self.max_hr = Some(self.max_hr.map_or(hr, |m| m.max(hr)));
        }
    }

    fn vertical_drop(&self) -> Option<f64> {
        Some(self.start_elevation? - self.end_elevation?)
    }

    fn to_run(&self, id: u32) -> Option<Run> {
        let start_elevation = self.start_elevation?;
        let end_elevation = self.end_elevation?;
        let vertical_drop = start_elevation - end_elevation;

        Some(Run {
            id,
            start_index: self.start_index,
            end_index: self.end_index,
            distance: self.distance,
            vertical_drop,
            avg_speed: if self.speed_count > 0 {
                self.speed_sum / self.speed_count as f64
            } else {
                0.0
            },
            max_speed: self.max_speed,
            duration_secs: seconds_between(self.start_time, self.end_time),
            start_elevation,
            end_elevation,
            avg_slope: if self.distance > 0.0 {
                vertical_drop / self.distance
            } else {
                0.0
            },
            start_time: self.start_time,
            end_time: self.end_time,
            avg_heart_rate: (self.hr_count > 0).then(|| self.hr_sum / self.hr_count as f64),
            max_heart_rate: self.max_hr,
        })
    }

    fn qualifies(&self, config: &SegmentationConfig) -> bool {
        self.end_index > self.start_index
            && self.distance >= config.min_run_distance_m
            && self
                .vertical_drop()
                .is_some_and(|drop| drop >= 0.0 && drop >= config.min_run_vertical_m)
    }
}

/// Segmentation state carried between points
#[derive(Debug, Clone)]
pub struct SegmentState {
    window: VecDeque<WindowEntry>,
    /// Last accepted (non-outlier) point and its index
    previous: Option<(usize, TrackPoint)>,
    raw_phase: Phase,
    phase: Phase,
    /// Candidate phase and how many consecutive points it has held
    pending: Option<(Phase, usize)>,
    /// Range covered by the current streak of descending classifications
    descent: Option<RunAccumulator>,
    open: Option<RunAccumulator>,
    tail: Option<RunAccumulator>,
    last_run_end: Option<usize>,
    next_id: u32,
}

impl Default for SegmentState {
    fn default() -> Self {
        Self {
            window: VecDeque::new(),
            previous: None,
            raw_phase: Phase::Stationary,
            phase: Phase::Stationary,
            pending: None,
            descent: None,
            open: None,
            tail: None,
            last_run_end: None,
            next_id: 1,
        }
    }
}

impl SegmentState {
    /// Confirmed phase after hysteresis
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Classification of the most recent point, before hysteresis
    pub fn raw_phase(&self) -> Phase {
        self.raw_phase
    }

    /// Provisional view of the run currently being built.
    ///
    /// The run may still be discarded if it ends below the minimums.
    pub fn open_run(&self) -> Option<Run> {
        self.open.as_ref().and_then(|acc| acc.to_run(self.next_id))
    }

    fn push_window(&mut self, point: &TrackPoint, window_samples: usize) {
        self.window.push_back(WindowEntry {
            timestamp: point.timestamp,
            elevation: point.elevation,
            speed: point.speed,
        });
        while self.window.len() > window_samples.max(1) + 1 {
            self.window.pop_front();
        }
    }

    fn close(&mut self, run: RunAccumulator, config: &SegmentationConfig) -> Option<Run> {
        if !run.qualifies(config) {
            log::debug!(
                "discarded descent {}..={} ({:.0} m, {:.0} m drop)",
                run.start_index,
                run.end_index,
                run.distance,
                run.vertical_drop().unwrap_or(0.0)
            );
            return None;
        }

        let closed = run.to_run(self.next_id)?;
        self.next_id += 1;
        self.last_run_end = Some(closed.end_index);
        log::debug!(
            "run {} closed: points {}..={}, {:.0} m, {:.0} m drop",
            closed.id,
            closed.start_index,
            closed.end_index,
            closed.distance,
            closed.vertical_drop
        );
        Some(closed)
    }
}

/// Classify the window by net elevation rate and mean speed.
fn classify(window: &VecDeque<WindowEntry>, config: &SegmentationConfig) -> Phase {
    let pairs = window.len().saturating_sub(1);
    if pairs == 0 {
        return Phase::Stationary;
    }

    let mean_speed = window.iter().skip(1).map(|e| e.speed).sum::<f64>() / pairs as f64;

    let first = window.iter().find(|e| e.elevation.is_some());
    let last = window.iter().rev().find(|e| e.elevation.is_some());
    let rate = match (first, last) {
        (Some(first), Some(last)) => {
            let dt = seconds_between(first.timestamp, last.timestamp);
            match (first.elevation, last.elevation) {
                (Some(from), Some(to)) if dt > 0.0 => Some((to - from) / dt),
                _ => None,
            }
        }
        _ => None,
    };

    match rate {
        Some(rate) if rate <= -config.descent_rate_mps && mean_speed >= config.min_moving_speed_mps => {
            Phase::Descending
        }
        Some(rate) if rate >= config.ascent_rate_mps => Phase::Ascending,
        _ => Phase::Stationary,
    }
}

/// Advance the segmentation state by one point.
///
/// Returns the new state and the run closed by this point, if any. Outlier
/// points leave the state untouched.
pub fn advance(
    mut state: SegmentState,
    index: usize,
    point: &TrackPoint,
    config: &SegmentationConfig,
) -> (SegmentState, Option<Run>) {
    if point.outlier {
        return (state, None);
    }

    state.push_window(point, config.window_samples);
    let raw = classify(&state.window, config);
    state.raw_phase = raw;

    // Hysteresis
    if raw == state.phase {
        state.pending = None;
    } else {
        let held = match state.pending {
            Some((phase, count)) if phase == raw => count + 1,
            _ => 1,
        };
        if held >= config.sustain_samples.max(1) {
            log::debug!("phase {:?} -> {:?} at point {}", state.phase, raw, index);
            state.phase = raw;
            state.pending = None;
        } else {
            state.pending = Some((raw, held));
        }
    }

    // A descent begins at the last point before it was first detected
    if raw == Phase::Descending {
        match state.descent.as_mut() {
            Some(acc) => acc.push(index, point),
            None => {
                let after_last_run =
                    |i: usize| state.last_run_end.map_or(true, |end| i > end);
                let mut acc = match &state.previous {
                    Some((i, previous)) if after_last_run(*i) => {
                        RunAccumulator::begin(*i, previous)
                    }
                    _ => RunAccumulator::begin(index, point),
                };
                if acc.end_index != index {
                    acc.push(index, point);
                }
                state.descent = Some(acc);
            }
        }
    } else {
        state.descent = None;
    }

    let descending = raw == Phase::Descending && state.phase == Phase::Descending;
    let mut closed = None;

    match state.open.take() {
        Some(mut run) if descending => {
            if let Some(tail) = state.tail.take() {
                run.absorb(tail);
            }
            run.push(index, point);
            state.open = Some(run);
        }
        Some(run) => {
            let tail = state
                .tail
                .get_or_insert_with(|| RunAccumulator::tail_of(&run));
            tail.push(index, point);
            let gap = seconds_between(run.end_time, tail.end_time);

            if state.phase != Phase::Descending && gap > config.max_merge_gap_secs {
                state.tail = None;
                closed = state.close(run, config);
            } else {
                state.open = Some(run);
            }
        }
        None if descending => {
            state.open = state
                .descent
                .take()
                .or_else(|| Some(RunAccumulator::begin(index, point)));
        }
        None => {}
    }

    state.previous = Some((index, point.clone()));
    (state, closed)
}

/// Close the open run at end of stream.
///
/// Points collected after the last descending point are not part of the run.
pub fn finish(mut state: SegmentState, config: &SegmentationConfig) -> (SegmentState, Option<Run>) {
    state.tail = None;
    state.descent = None;
    let closed = match state.open.take() {
        Some(run) => state.close(run, config),
        None => None,
    };
    (state, closed)
}

/// Segment a complete point sequence.
pub fn segment(points: &[TrackPoint], config: &SegmentationConfig) -> Vec<Run> {
    let mut state = SegmentState::default();
    let mut runs = Vec::new();

    for (index, point) in points.iter().enumerate() {
        let (next, closed) = advance(state, index, point, config);
        state = next;
        runs.extend(closed);
    }

    let (_, closed) = finish(state, config);
    runs.extend(closed);
    runs
}

/// Incremental driver for live tracks
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmentationConfig,
    state: SegmentState,
}

impl Segmenter {
    pub fn new(config: SegmentationConfig) -> Self {
        Self {
            config,
            state: SegmentState::default(),
        }
    }

    /// Feed the next point; returns a run if this point closed one.
    pub fn push(&mut self, index: usize, point: &TrackPoint) -> Option<Run> {
        let state = std::mem::take(&mut self.state);
        let (state, closed) = advance(state, index, point, &self.config);
        self.state = state;
        closed
    }

    /// Finalize the open run at end of stream.
    pub fn finish(&mut self) -> Option<Run> {
        let state = std::mem::take(&mut self.state);
        let (state, closed) = finish(state, &self.config);
        self.state = state;
        closed
    }

    pub fn state(&self) -> &SegmentState {
        &self.state
    }
}
