//! # relaymux: high-availability MPEG-TS splice multiplexer
//!
//! relaymux continuously produces a single decoder-valid transport stream
//! by splicing between a live input and a looped fallback. When the live
//! source degrades it cuts away transparently; when the live source
//! recovers it cuts back, always at an IDR boundary, with regenerated
//! PSI, re-injected parameter sets, rebased timestamps, and unbroken
//! per-PID continuity counters.
//!
//! ## Pipeline
//!
//! Two (or more) [`input::InputReader`]s ingest raw TS bytes from FIFOs or
//! TCP sockets on their own tasks, reassembling packets and discovering
//! stream structure. The [`orchestrator::Orchestrator`] asks the
//! [`arbiter::SourceArbiter`] which source should drive the output, feeds
//! the selected packets through the [`splice::SpliceEngine`], and writes
//! the result to the downstream FIFO via [`sink::OutputSink`].
//!
//! ## Output guarantees
//!
//! - every emitted byte belongs to an aligned 188-byte packet
//! - PCR is strictly monotonic modulo its wrap
//! - per-PID continuity counters never skip across cuts
//! - every cut starts at an IDR, preceded by that stream's SPS/PPS
//! - PAT and PMT repeat at ~100 ms intervals

/// Source selection state machine
pub mod arbiter;

/// H.264/H.265 NAL inspection
pub mod codec;

/// Configuration loading
pub mod config;

/// Error types
pub mod error;

/// Input readers, byte sources, and packet rings
pub mod input;

/// Steady-state composition
pub mod orchestrator;

/// Output FIFO writer
pub mod sink;

/// The splice engine and clock arithmetic
pub mod splice;

/// Transport stream packet layer
pub mod ts;

/// Shared utilities
pub mod utils;

pub use error::{RelayError, Result};
