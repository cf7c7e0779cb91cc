//! Packets exchanged over the command channel.
//!
//! A packet is the 8-byte header plus an opaque payload. Command packets
//! carry nested TLV records in the payload; the channel itself only looks
//! at one of them, the request identifier.

use bytes::{Bytes, BytesMut};
use rand::Rng;

use crate::header::{packet_type, TlvHeader, HEADER_SIZE};
use crate::tlv::{self, TLV_REQUEST_ID};
use crate::WireError;

/// Generated request-id length, excluding the trailing NUL
pub const REQUEST_ID_LEN: usize = 31;

/// Sanity cap on a single packet's payload
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// One packet: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: TlvHeader,
    payload: Vec<u8>,
}

impl Packet {
    /// Create a packet of the given type
    pub fn new(ty: u32, payload: Vec<u8>) -> Self {
        Self {
            header: TlvHeader::new(ty, payload.len()),
            payload,
        }
    }

    /// Reassemble a packet received from the wire.
    ///
    /// The header is kept exactly as received; callers that rewrite the
    /// payload afterwards (decryption) use [`Packet::set_payload`].
    pub fn from_parts(header: TlvHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// The packet header
    pub fn header(&self) -> &TlvHeader {
        &self.header
    }

    /// The packet type, compared raw
    pub fn ty(&self) -> u32 {
        self.header.ty
    }

    /// The packet payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload byte count
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Consume the packet, keeping the payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Whether this packet bypasses the session cipher
    pub fn is_plain(&self) -> bool {
        self.header.ty == packet_type::PLAIN_REQUEST || self.header.ty == packet_type::PLAIN_RESPONSE
    }

    /// Replace the payload and update the header length to match
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.header.length = (HEADER_SIZE + payload.len()) as u32;
        self.payload = payload;
    }

    /// The request identifier, when one is attached
    pub fn request_id(&self) -> Option<&str> {
        tlv::find_str(&self.payload, TLV_REQUEST_ID)
    }

    /// Attach a generated request identifier unless one is already present.
    ///
    /// The generated id is `REQUEST_ID_LEN` printable-ASCII characters drawn
    /// from `[0x21, 0x7E]`. Calling this on a packet that already carries an
    /// id is a no-op, so retransmission paths never stack a second one.
    pub fn ensure_request_id(&mut self) {
        if self.request_id().is_some() {
            return;
        }
        let id = generate_request_id();
        tlv::append_str(&mut self.payload, TLV_REQUEST_ID, &id);
        self.header.length = (HEADER_SIZE + self.payload.len()) as u32;
    }

    /// Encode the packet to its wire form
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one packet from a contiguous wire buffer
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < HEADER_SIZE {
            return Err(WireError::Incomplete);
        }

        let mut header_raw = [0u8; HEADER_SIZE];
        header_raw.copy_from_slice(&raw[..HEADER_SIZE]);
        let header = TlvHeader::from_bytes(header_raw);

        let payload_len = header.payload_length()?;
        if payload_len > MAX_PACKET_SIZE {
            return Err(WireError::Size(payload_len));
        }
        if raw.len() < HEADER_SIZE + payload_len {
            return Err(WireError::Incomplete);
        }

        Ok(Self {
            header,
            payload: raw[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec(),
        })
    }
}

fn generate_request_id() -> String {
    let mut rng = rand::thread_rng();
    (0..REQUEST_ID_LEN)
        .map(|_| rng.gen_range(0x21u8..=0x7E) as char)
        .collect()
}
