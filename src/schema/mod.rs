//! Live sample wire schema (ski.live_sample.v1)
//!
//! This module defines the shape of one event arriving from the location or
//! heart-rate sensor during a live recording, plus NDJSON parsing and
//! validation. Positions and heart-rate readings are separate events.

mod adapter;
mod live_event;

pub use adapter::*;
pub use live_event::*;
