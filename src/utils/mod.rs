//! Common utilities shared across the crate.

/// MPEG-2 CRC32 for PSI table generation and validation
pub mod crc;

pub use crc::Crc32Mpeg2;
