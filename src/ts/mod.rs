//! # MPEG Transport Stream layer
//!
//! Packet-level types and parsers shared by the input and output sides:
//!
//! - Aligned 188-byte packet handling with in-place field rewriting
//! - Byte-stream reassembly with resync (unaligned FIFO/socket input)
//! - PSI table parsing with per-PID section reassembly
//! - PES header parsing and generation
//! - Regeneration of single-section PAT/PMT packets

/// Core packet type, PSI table models, and constants
pub mod types;

/// Header, adaptation field, and PSI section parsing
pub mod parser;

/// Byte stream to aligned packet conversion
pub mod reassembler;

/// PES header handling
pub mod pes;

/// Output-side PAT/PMT packetization
pub mod psi;

pub use parser::{SectionAssembler, TsPacketParser};
pub use pes::{PesHeader, PesTimestamps};
pub use psi::PsiGenerator;
pub use reassembler::Reassembler;
pub use types::{
    Pat, Pmt, TsPacket, PCR_MOD, PID_NULL, PID_PAT, PTS_MOD, STREAM_TYPE_AAC, STREAM_TYPE_AC3,
    STREAM_TYPE_H264, STREAM_TYPE_H265, SYNC_BYTE, TS_PACKET_SIZE,
};
