//! Stand-in command handler.
//!
//! The real command subsystem plugs in at the `CommandHandler` seam; this
//! handler logs every packet and keeps the session running so the binary
//! exercises the full channel end to end.

use async_trait::async_trait;
use tracing::info;

use tether_session::{CommandHandler, Remote, SessionError, Verdict};
use tether_wire::Packet;

/// Logs received packets and never stops the session
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl CommandHandler for LogHandler {
    async fn handle(&self, remote: &Remote, packet: Packet) -> Result<Verdict, SessionError> {
        info!(
            "packet: type {:#x}, {} payload bytes, request-id {:?}",
            packet.ty(),
            packet.payload_len(),
            packet.request_id()
        );

        // Responses claim their registered completion, if any.
        if let Some(id) = packet.request_id() {
            if let Some(completion) = remote.take_completion(id) {
                completion(&packet);
            }
        }

        Ok(Verdict::Continue)
    }
}
