//! Packet framing, encoding/decoding, and TLV records for the tether
//! command channel.
//!
//! This crate provides the low-level packet protocol spoken over the
//! channel: the 8-byte outer header, the nested TLV records carried in
//! command payloads, and the request-identifier record the transport
//! attaches to outbound requests.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 BE length        | header + payload bytes     |
//! +----------------------+----------------------------+
//! | u32 type             | stored order, compared raw |
//! +----------------------+----------------------------+
//! | payload              | length - 8 bytes           |
//! |                      | (ciphertext when a session |
//! |                      | cipher is set and the type |
//! |                      | is not PLAIN_*)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod packet;
pub mod tlv;

// Re-export main types
pub use error::WireError;
pub use header::{packet_type, TlvHeader, HEADER_SIZE};
pub use packet::{Packet, MAX_PACKET_SIZE, REQUEST_ID_LEN};
pub use tlv::{Tlv, TlvIter, TLV_REQUEST_ID};
