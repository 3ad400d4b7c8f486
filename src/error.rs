//! # Error Types
//!
//! Central error type for the relaymux library. Every fallible operation in
//! the crate returns [`Result`], and the variants map onto the error
//! categories the multiplexer distinguishes at runtime: transient I/O,
//! malformed stream data, readiness failures, and fatal startup conditions.

use thiserror::Error;

/// Primary error type for relaymux operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O errors from pipes, sockets, and files
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors produced while parsing TS, PSI, or PES structures
    #[error("parser error: {0}")]
    Parser(String),

    /// Invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Configuration file or environment override errors
    #[error("config error: {0}")]
    Config(String),

    /// Packet sync could not be re-acquired within the scan budget
    #[error("sync loss: no packet boundary within {scanned} bytes")]
    SyncLoss {
        /// Bytes examined before giving up
        scanned: usize,
    },

    /// A blocking wait on stream readiness hit its deadline
    #[error("not ready: {0}")]
    NotReady(String),

    /// Unrecoverable startup failure; the process exits non-zero
    #[error("fatal: {0}")]
    Fatal(String),
}

/// A specialized Result type for relaymux operations.
pub type Result<T> = std::result::Result<T, RelayError>;
