//! Packet header processing.
//!
//! This module defines the 8-byte header that frames every packet on the
//! command channel: a length covering the header plus the payload, followed
//! by the packet type.

use bytes::{BufMut, BytesMut};

use crate::WireError;

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Well-known packet types.
///
/// The type field is opaque to the channel: peers compare it bit-for-bit,
/// so the values are raw `u32` constants rather than a closed enum.
pub mod packet_type {
    /// Command request
    pub const REQUEST: u32 = 0;
    /// Command response
    pub const RESPONSE: u32 = 1;
    /// Request that bypasses the session cipher
    pub const PLAIN_REQUEST: u32 = 10;
    /// Response that bypasses the session cipher
    pub const PLAIN_RESPONSE: u32 = 11;
}

/// The 8-byte packet header.
///
/// `length` counts the header itself plus the payload and travels
/// big-endian. `ty` travels in its stored byte order (little-endian on all
/// targets this crate supports) and is never byte-swapped: both ends of the
/// protocol compare it raw, so normalizing it to network order here would
/// break interop with deployed peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvHeader {
    /// Total packet length: header plus payload
    pub length: u32,
    /// Packet type, compared raw
    pub ty: u32,
}

impl TlvHeader {
    /// Create a header for a packet with the given type and payload size
    pub fn new(ty: u32, payload_len: usize) -> Self {
        Self {
            length: (HEADER_SIZE + payload_len) as u32,
            ty,
        }
    }

    /// Payload byte count implied by the header
    pub fn payload_length(&self) -> Result<usize, WireError> {
        (self.length as usize)
            .checked_sub(HEADER_SIZE)
            .ok_or(WireError::Underflow(self.length))
    }

    /// Encode the header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
        buf.put_slice(&self.ty.to_le_bytes());
    }

    /// Encode the header to its fixed wire form
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..4].copy_from_slice(&self.length.to_be_bytes());
        raw[4..].copy_from_slice(&self.ty.to_le_bytes());
        raw
    }

    /// Decode a header from its fixed wire form
    pub fn from_bytes(raw: [u8; HEADER_SIZE]) -> Self {
        Self {
            length: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            ty: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = TlvHeader::new(packet_type::REQUEST, 120);
        let decoded = TlvHeader::from_bytes(header.to_bytes());
        assert_eq!(header, decoded);
        assert_eq!(decoded.payload_length().unwrap(), 120);
    }

    #[test]
    fn test_length_is_big_endian() {
        let header = TlvHeader::new(0x0001, 5);
        let raw = header.to_bytes();
        assert_eq!(&raw[..4], &13u32.to_be_bytes());
    }

    #[test]
    fn test_type_travels_in_stored_order() {
        let header = TlvHeader::new(0x0042, 0);
        let raw = header.to_bytes();
        assert_eq!(&raw[4..], &[0x42, 0x00, 0x00, 0x00]);
        assert_eq!(TlvHeader::from_bytes(raw).ty, 0x0042);
    }

    #[test]
    fn test_underflow_length_rejected() {
        let header = TlvHeader {
            length: 4,
            ty: packet_type::REQUEST,
        };
        assert!(matches!(
            header.payload_length(),
            Err(WireError::Underflow(4))
        ));
    }
}
