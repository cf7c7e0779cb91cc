//! TCP-over-TLS command channel for the tether agent.
//!
//! This crate owns the transport core of the agent: it establishes a
//! long-lived channel with the controller under three topologies, wraps it
//! in TLS, frames TLV packets over it, and drives the dispatch loop that
//! feeds the command subsystem.
//!
//! ## Topologies
//!
//! - **Reverse**: dial the controller (`tcp://host:port`,
//!   `tcp6://[host]:port?scope`), retrying inside a bounded window.
//! - **Bind**: listen for one inbound controller connection
//!   (`tcp://:port`), closing the listener the moment it is accepted.
//! - **Staged**: adopt a connected socket inherited from a bootstrap
//!   stage, inferring whether the stage bound or dialed so a later
//!   re-establishment can repeat the same topology.
//!
//! ## Session shape
//!
//! The outer supervisor builds a [`Transport`], wraps it in a [`Remote`],
//! calls [`Transport::configure`], and runs [`dispatch::run`] until the
//! session ends; on recoverable failure it resets the transport and
//! configures again. Every channel operation holds the session lock for
//! its full duration, so concurrent transmitters interleave whole packets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dial;
pub mod dispatch;
pub mod error;
pub mod frames;
pub mod remote;
pub mod staged;
pub mod timebase;
pub mod tls;
pub mod transport;
pub mod url;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types
pub use dial::RetryPolicy;
pub use error::SessionError;
pub use remote::{
    CipherError, CommandHandler, Completion, NullScheduler, PacketCipher, Remote, Scheduler,
    Verdict,
};
pub use staged::StagedOrigin;
pub use transport::{ChannelStream, Timeouts, Transport, TransportKind};
pub use url::{ChannelUrl, Scheme};
