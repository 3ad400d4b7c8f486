//! # Splice engine
//!
//! Output-side packet transformation: PID normalization, continuity counter
//! ownership, PTS/DTS/PCR rebasing onto a single monotonic output clock,
//! and PSI plus parameter-set injection at cut points.

/// Modular 33-bit / 42-bit clock arithmetic
pub mod timestamps;

/// The packet transform and cut procedure
pub mod engine;

pub use engine::{EngineStats, SpliceEngine};
