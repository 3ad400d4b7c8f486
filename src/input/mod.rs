//! # Input side
//!
//! One [`InputReader`] per upstream transport stream. Each reader owns its
//! byte source (FIFO or TCP), an ingest task that reassembles packets and
//! discovers stream structure, a bounded ring of recent packets, and the
//! readiness/health signals the arbiter and orchestrator consume.

/// Byte source abstraction over FIFOs and TCP clients
pub mod source;

/// Bounded packet ring with absolute indexing
pub mod ring;

/// The reader itself: ingest task, discovery, readiness, health
pub mod reader;

pub use reader::{Health, IdrPoint, InputReader, StreamInfo};
pub use ring::PacketRing;
pub use source::{make_source, ByteSource};
