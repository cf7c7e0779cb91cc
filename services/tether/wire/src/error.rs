//! Packet protocol error types.

use thiserror::Error;

/// Packet protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete header (need more data)
    #[error("incomplete header")]
    Incomplete,

    /// Header length smaller than the header itself
    #[error("length under header: {0}")]
    Underflow(u32),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),
}
