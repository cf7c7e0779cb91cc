//! Session error types.

use thiserror::Error;

/// Errors surfaced by channel operations.
///
/// Fatal conditions bubble up to the dispatch loop, which terminates
/// cleanly so the outer supervisor can reset the transport and retry.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket or TLS I/O failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Frame violated the packet protocol
    #[error(transparent)]
    Wire(#[from] tether_wire::WireError),

    /// Peer closed the channel
    #[error("peer closed the channel")]
    PeerClosed,

    /// Channel URL could not be parsed
    #[error("invalid channel url: {0}")]
    Url(String),

    /// Connect attempts exhausted the retry window
    #[error("retry window exhausted")]
    RetryExhausted(#[source] std::io::Error),

    /// The session deadline passed during bring-up
    #[error("session expired")]
    Expired,

    /// No connected channel
    #[error("no connected channel")]
    NoChannel,

    /// Packet cipher failure
    #[error("cipher: {0}")]
    Cipher(String),

    /// Scheduler failed to come up
    #[error("scheduler: {0}")]
    Scheduler(String),
}
