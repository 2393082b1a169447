//! # handoff
//!
//! A three-stage message pipeline where each stage hands a work item to the
//! next through a durable queue.
//!
//! Every hop carries the W3C trace context next to the item so the trace
//! stays connected, and the item itself carries the milestone timestamps
//! the last stage turns into latency metrics. An item that fails at any
//! stage is tagged and passed on; later stages skip it instead of working
//! on it.

pub mod channel;
pub mod config;
pub mod db;
pub mod derived;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;
