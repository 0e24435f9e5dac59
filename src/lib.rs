//! Asynchronous command timing for compute-API interception layers.
//!
//! Producers hand over each asynchronous operation as it is issued. The
//! pipeline retains the operation's handle, polls it to completion, maps the
//! device's profiling counters onto the host timeline and aggregates
//! per-call-site statistics, optionally replaying each sample into trace
//! sinks.

pub mod clock;
pub mod combine;
pub mod config;
pub mod driver;
pub mod export;
pub mod pipeline;
pub mod sink;
pub mod stats;
pub mod tracker;

pub use config::Config;
pub use pipeline::{DrainSummary, Pipeline};
