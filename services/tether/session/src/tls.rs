//! TLS session management.
//!
//! The crypto provider is process-wide state, so `acquire` installs it
//! exactly once and hands back a reference-counted guard; a transport torn
//! down and re-created never races the installation. Peer verification is
//! deliberately disabled (the controller authenticates at the packet
//! layer, not with certificates) and the client negotiates the highest
//! protocol version the peer supports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::SessionError;

/// Fixed cover payload written immediately after the handshake.
///
/// The bytes mimic a web request so the first application record blends
/// with browser traffic; the peer's answer, if any, is never read here.
pub const COVER_REQUEST: &[u8] = b"GET /123456789 HTTP/1.0\r\n\r\n";

static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Reference-counted hold on the process-wide TLS runtime
#[derive(Debug)]
pub struct TlsGuard(());

/// Bring up the process-wide TLS state and return a hold on it.
///
/// Idempotent: the provider is installed on the first call and every later
/// call only bumps the session count.
pub fn acquire() -> TlsGuard {
    static INSTALL: OnceLock<()> = OnceLock::new();
    INSTALL.get_or_init(|| {
        // An embedding application may have installed a provider first;
        // either way one is in place afterwards.
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("crypto provider already installed");
        }
    });
    ACTIVE_SESSIONS.fetch_add(1, Ordering::SeqCst);
    TlsGuard(())
}

impl Drop for TlsGuard {
    fn drop(&mut self) {
        // Last session out. The provider itself has no teardown; the count
        // exists so re-acquisition stays balanced across resets.
        ACTIVE_SESSIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Client handshake plus the cover write.
///
/// `server_name` is only used to satisfy the connector API; nothing about
/// the peer is verified.
pub async fn negotiate(
    _runtime: &TlsGuard,
    tcp: TcpStream,
    server_name: &str,
) -> Result<TlsStream<TcpStream>, SessionError> {
    let connector = TlsConnector::from(Arc::new(client_config()));
    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|_| SessionError::Url(format!("bad tls server name: {server_name}")))?;

    let mut stream = connector.connect(name, tcp).await?;
    debug!("tls handshake complete, sending cover request");

    // One write call so the cover goes out as a single record.
    stream.write_all(COVER_REQUEST).await?;
    stream.flush().await?;

    Ok(stream)
}

fn client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
