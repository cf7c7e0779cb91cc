//! The session object shared by the dispatch loop and the rest of the
//! agent.
//!
//! Every channel operation acquires the session lock for its full duration:
//! concurrent transmitters interleave whole packets on the TLS stream,
//! never fragments, and nothing observes the context mid-mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use tether_wire::Packet;

use crate::frames;
use crate::transport::Transport;
use crate::SessionError;

/// Error from a packet cipher
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Per-packet payload cipher attached to a session.
///
/// Inputs are borrowed; outputs are fresh buffers owned by the caller.
pub trait PacketCipher: Send + Sync {
    /// Seal a plaintext payload
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    /// Open a ciphertext payload
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// What the command handler wants the dispatch loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the session running
    Continue,
    /// End the session cleanly
    Stop,
}

/// The command subsystem seam.
///
/// The dispatch loop hands every received packet to `handle` in arrival
/// order and waits on `join` during teardown so spawned command tasks do
/// not outlive the session.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process one received packet
    async fn handle(&self, remote: &Remote, packet: Packet) -> Result<Verdict, SessionError>;

    /// Wait for outstanding command tasks to finish
    async fn join(&self) {}
}

/// The scheduler subsystem seam, brought up and torn down around the
/// dispatch loop.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Bring the scheduler up for this session
    async fn initialize(&self, remote: &Remote) -> Result<(), SessionError>;

    /// Tear the scheduler down
    async fn destroy(&self);
}

/// A scheduler that schedules nothing
#[derive(Debug, Default)]
pub struct NullScheduler;

#[async_trait]
impl Scheduler for NullScheduler {
    async fn initialize(&self, _remote: &Remote) -> Result<(), SessionError> {
        Ok(())
    }

    async fn destroy(&self) {}
}

/// Completion callback invoked when the response to a request arrives
pub type Completion = Box<dyn FnOnce(&Packet) + Send>;

/// One active session: the transport behind the session lock plus the
/// collaborator seams.
pub struct Remote {
    transport: Mutex<Transport>,
    cipher: RwLock<Option<Arc<dyn PacketCipher>>>,
    commands: Arc<dyn CommandHandler>,
    scheduler: Arc<dyn Scheduler>,
    completions: StdMutex<HashMap<String, Completion>>,
}

impl Remote {
    /// Create a session around a transport
    pub fn new(
        transport: Transport,
        commands: Arc<dyn CommandHandler>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            cipher: RwLock::new(None),
            commands,
            scheduler,
            completions: StdMutex::new(HashMap::new()),
        }
    }

    /// The transport, behind the session lock
    pub fn transport(&self) -> &Mutex<Transport> {
        &self.transport
    }

    /// The current session cipher, when one is attached
    pub fn cipher(&self) -> Option<Arc<dyn PacketCipher>> {
        self.cipher.read().expect("cipher lock poisoned").clone()
    }

    /// Attach or clear the session cipher
    pub fn set_cipher(&self, cipher: Option<Arc<dyn PacketCipher>>) {
        *self.cipher.write().expect("cipher lock poisoned") = cipher;
    }

    /// The command subsystem
    pub fn commands(&self) -> &Arc<dyn CommandHandler> {
        &self.commands
    }

    /// The scheduler subsystem
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Register a completion handler under a request id
    pub fn register_completion(&self, request_id: String, completion: Completion) {
        debug!("registering completion for request {request_id}");
        self.completions
            .lock()
            .expect("completion lock poisoned")
            .insert(request_id, completion);
    }

    /// Claim the completion handler for a request id, if any
    pub fn take_completion(&self, request_id: &str) -> Option<Completion> {
        self.completions
            .lock()
            .expect("completion lock poisoned")
            .remove(request_id)
    }

    /// Transmit one packet and consume it.
    ///
    /// Under the session lock: a request id is attached when the packet has
    /// none; the completion, when supplied, is registered under that id;
    /// non-plain payloads are encrypted with the session cipher.
    pub async fn transmit(
        &self,
        mut packet: Packet,
        completion: Option<Completion>,
    ) -> Result<(), SessionError> {
        let mut transport = self.transport.lock().await;

        packet.ensure_request_id();
        if let Some(completion) = completion {
            if let Some(id) = packet.request_id() {
                let id = id.to_string();
                self.register_completion(id, completion);
            }
        }

        let cipher = self.cipher();
        let stream = transport.stream_mut().ok_or(SessionError::NoChannel)?;
        frames::write_packet(stream, packet, cipher.as_deref()).await
    }

    /// Receive one packet under the session lock
    pub async fn receive(&self) -> Result<Packet, SessionError> {
        let mut transport = self.transport.lock().await;
        let cipher = self.cipher();
        let stream = transport.stream_mut().ok_or(SessionError::NoChannel)?;
        let packet = frames::read_packet(stream, cipher.as_deref()).await?;
        transport.mark_packet();
        Ok(packet)
    }
}
