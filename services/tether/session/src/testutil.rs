//! Shared helpers for the crate's tests: loopback transports, a throwaway
//! TLS server, and a trivially invertible packet cipher.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use tether_wire::Packet;

use crate::remote::{CipherError, CommandHandler, PacketCipher, Remote, Verdict};
use crate::transport::{ChannelStream, Timeouts, Transport};
use crate::{tls, SessionError};

/// XOR every payload byte with a fixed key. Worthless as cryptography,
/// ideal for observing that the cipher hooks run.
pub(crate) struct XorCipher(pub u8);

impl PacketCipher for XorCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(plaintext.iter().map(|byte| byte ^ self.0).collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.iter().map(|byte| byte ^ self.0).collect())
    }
}

/// Records every dispatched packet; optionally answers `Stop` after a set
/// number of packets.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    seen: Mutex<Vec<(u32, Vec<u8>)>>,
    stop_after: Option<usize>,
}

impl RecordingHandler {
    pub(crate) fn stopping_after(count: usize) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            stop_after: Some(count),
        }
    }

    pub(crate) fn seen(&self) -> Vec<(u32, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(&self, _remote: &Remote, packet: Packet) -> Result<Verdict, SessionError> {
        let mut seen = self.seen.lock().unwrap();
        seen.push((packet.ty(), packet.payload().to_vec()));
        match self.stop_after {
            Some(count) if seen.len() >= count => Ok(Verdict::Stop),
            _ => Ok(Verdict::Continue),
        }
    }
}

/// A transport wired to one end of a loopback TCP pair, plus the peer end
pub(crate) async fn loopback_transport(timeouts: Timeouts) -> (Transport, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();

    let mut transport = Transport::new(None, timeouts);
    transport.install_stream(ChannelStream::Plain(client));
    (transport, peer)
}

/// Bind an ephemeral listener, note the port, release it
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A TLS acceptor with a fresh self-signed certificate
pub(crate) fn tls_acceptor() -> TlsAcceptor {
    // Installs the provider the server side needs as well.
    let _runtime = tls::acquire();

    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der =
        rustls::pki_types::PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Accept one TCP connection, terminate TLS, and consume the cover request
pub(crate) async fn tls_accept_one(listener: TcpListener) {
    let (tcp, _) = listener.accept().await.unwrap();
    tls_serve(tcp).await;
}

/// Terminate TLS on an accepted stream and consume the cover request
pub(crate) async fn tls_serve(tcp: TcpStream) {
    let mut stream = tls_serve_stream(tcp).await;
    let mut cover = [0u8; tls::COVER_REQUEST.len()];
    stream.read_exact(&mut cover).await.unwrap();
    assert_eq!(&cover[..], tls::COVER_REQUEST);
}

/// Terminate TLS on an accepted stream without touching the cover request
pub(crate) async fn tls_serve_stream(
    tcp: TcpStream,
) -> tokio_rustls::server::TlsStream<TcpStream> {
    tls_acceptor().accept(tcp).await.unwrap()
}
