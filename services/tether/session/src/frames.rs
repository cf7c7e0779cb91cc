//! Frame I/O over the secure channel.
//!
//! One packet on the wire is the 8-byte header followed by the payload.
//! When a session cipher is attached, payloads of non-plain packets are
//! encrypted; the header always travels in the clear.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use tether_wire::{Packet, TlvHeader, WireError, HEADER_SIZE, MAX_PACKET_SIZE};

use crate::remote::PacketCipher;
use crate::SessionError;

/// Read exactly one packet.
///
/// A clean close from the peer surfaces as [`SessionError::PeerClosed`];
/// short reads mid-frame surface the same way since the frame can never be
/// completed. Ciphertext payloads are replaced by their decryption before
/// the packet is returned.
pub async fn read_packet<R>(
    stream: &mut R,
    cipher: Option<&dyn PacketCipher>,
) -> Result<Packet, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_SIZE];
    stream.read_exact(&mut raw).await.map_err(map_eof)?;
    let header = TlvHeader::from_bytes(raw);

    let payload_len = header.payload_length()?;
    if payload_len > MAX_PACKET_SIZE {
        return Err(WireError::Size(payload_len).into());
    }

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await.map_err(map_eof)?;
    trace!(
        "received packet type {:#x} with {payload_len} payload bytes",
        header.ty
    );

    let mut packet = Packet::from_parts(header, payload);
    if let Some(cipher) = cipher {
        if !packet.is_plain() {
            let clear = cipher
                .decrypt(packet.payload())
                .map_err(|err| SessionError::Cipher(err.to_string()))?;
            packet.set_payload(clear);
        }
    }

    Ok(packet)
}

/// Write one packet and consume it.
///
/// Non-plain payloads are encrypted in place when a cipher is attached,
/// with the header length updated to the ciphertext size. The header goes
/// out first, then the payload, then a flush so the packet is not left
/// sitting in the TLS record buffer.
pub async fn write_packet<W>(
    stream: &mut W,
    mut packet: Packet,
    cipher: Option<&dyn PacketCipher>,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(cipher) = cipher {
        if !packet.is_plain() {
            let sealed = cipher
                .encrypt(packet.payload())
                .map_err(|err| SessionError::Cipher(err.to_string()))?;
            packet.set_payload(sealed);
        }
    }

    stream.write_all(&packet.header().to_bytes()).await?;
    stream.write_all(packet.payload()).await?;
    stream.flush().await?;
    trace!("transmitted packet type {:#x}", packet.ty());

    Ok(())
}

fn map_eof(err: io::Error) -> SessionError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SessionError::PeerClosed
    } else {
        SessionError::Io(err)
    }
}
