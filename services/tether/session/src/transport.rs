//! Transport lifecycle for the TCP/TLS command channel.
//!
//! A transport spans one logical session: it establishes the channel under
//! one of three topologies (reverse connect, bind listen, adoption of a
//! staged socket), drains stager leftovers, wraps the stream in TLS, and
//! tears everything down when the outer supervisor resets it.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::dial::{self, RetryPolicy};
use crate::staged;
use crate::timebase;
use crate::tls::{self, TlsGuard};
use crate::url::{ChannelUrl, Scheme};
use crate::SessionError;

/// Quiet period that ends the pre-TLS flush
const FLUSH_TICK: Duration = Duration::from_secs(1);

/// Transport kinds understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TLV packets over TLS over TCP
    TcpTls,
}

/// Session timeouts, all in whole seconds
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Idle seconds after the last packet before the session ends
    pub comms: u64,
    /// Outer retry window for connect and bind
    pub retry_total: u64,
    /// Seconds between connect attempts
    pub retry_wait: u64,
    /// Hard session deadline, in seconds from transport creation
    pub expiry: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            comms: 300,
            retry_total: 3600,
            retry_wait: 10,
            expiry: 7 * 24 * 3600,
        }
    }
}

/// Unified stream type for the channel
pub enum ChannelStream {
    /// Plain TCP, before the TLS handshake upgrades it
    Plain(TcpStream),
    /// TLS-wrapped channel
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl ChannelStream {
    /// The underlying TCP stream
    pub fn tcp(&self) -> &TcpStream {
        match self {
            ChannelStream::Plain(stream) => stream,
            ChannelStream::Tls(stream) => stream.get_ref().0,
        }
    }

    /// Peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Raw descriptor of the underlying stream
    pub fn as_raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ChannelStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ChannelStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ChannelStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            ChannelStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ChannelStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Mutable per-connection state
pub(crate) struct ChannelContext {
    pub(crate) stream: Option<ChannelStream>,
    pub(crate) tls: Option<TlsGuard>,
    /// Whether the previous establishment was bind-mode
    pub(crate) bound: bool,
    /// Remembered address: the listener (bind) or the peer (reverse)
    pub(crate) sock_desc: Option<SocketAddr>,
}

impl ChannelContext {
    fn new() -> Self {
        Self {
            stream: None,
            tls: None,
            bound: false,
            sock_desc: None,
        }
    }
}

/// One transport, spanning one logical session
pub struct Transport {
    kind: TransportKind,
    url: Option<String>,
    timeouts: Timeouts,
    start_time: u64,
    expiration_end: u64,
    comms_last_packet: u64,
    pub(crate) ctx: ChannelContext,
}

impl Transport {
    /// Create a TCP/TLS transport.
    ///
    /// The session deadline is fixed here and never moves, no matter how
    /// often the channel is re-established.
    pub fn new(url: Option<String>, timeouts: Timeouts) -> Self {
        let now = timebase::now_secs();
        Self {
            kind: TransportKind::TcpTls,
            url,
            timeouts,
            start_time: now,
            expiration_end: now + timeouts.expiry,
            comms_last_packet: now,
            ctx: ChannelContext::new(),
        }
    }

    /// The transport kind
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The channel URL, when one was given
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// The session timeouts
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// When the current establishment began, in timebase seconds
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Absolute session deadline in timebase seconds
    pub fn expiration_end(&self) -> u64 {
        self.expiration_end
    }

    /// When the last packet was seen, in timebase seconds
    pub fn comms_last_packet(&self) -> u64 {
        self.comms_last_packet
    }

    /// Establish the channel: dial, bind, or adopt; then flush stager
    /// leftovers and negotiate TLS.
    ///
    /// `inherited_fd` is only consulted when the transport has neither a
    /// `tcp`/`tcp6` URL nor an address remembered from a prior adoption.
    pub async fn configure(&mut self, inherited_fd: Option<RawFd>) -> Result<(), SessionError> {
        let now = timebase::now_secs();
        self.start_time = now;
        self.comms_last_packet = now;

        let policy = RetryPolicy {
            total: self.timeouts.retry_total,
            wait: self.timeouts.retry_wait,
            expires_at: self.expiration_end,
        };

        let (tcp, server_name) = if let Some(raw) = self.url.clone().filter(|u| !u.is_empty()) {
            let url = ChannelUrl::parse(&raw)?;
            debug!("establishing channel for {url}");
            let stream = match (url.scheme, url.host.as_deref()) {
                (Scheme::Tcp, None) => dial::bind_listen(url.port).await?,
                (Scheme::Tcp, Some(host)) => dial::reverse_v4(host, url.port, policy).await?,
                (Scheme::Tcp6, Some(host)) => {
                    dial::reverse_v6(host, url.port, url.scope_id, policy).await?
                }
                // The parser never yields a hostless tcp6 URL.
                (Scheme::Tcp6, None) => return Err(SessionError::Url(raw)),
            };
            let name = url.host.clone().unwrap_or_else(|| peer_name(&stream));
            (stream, name)
        } else if let Some(addr) = self.ctx.sock_desc {
            if self.ctx.bound {
                debug!("re-listening on remembered stage address {addr}");
                let stream = dial::rebind(addr).await?;
                let name = peer_name(&stream);
                (stream, name)
            } else {
                debug!("reconnecting to remembered stage peer {addr}");
                (dial::reconnect(addr, policy).await?, addr.ip().to_string())
            }
        } else {
            let fd = inherited_fd.ok_or(SessionError::NoChannel)?;
            debug!("adopting staged descriptor {fd}");
            let origin = staged::infer_origin(fd);
            self.ctx.bound = origin.bound;
            self.ctx.sock_desc = origin.sock_desc;
            let stream = staged::adopt_stream(fd)?;
            let name = peer_name(&stream);
            (stream, name)
        };

        // Command child processes must not inherit the channel.
        set_no_inherit(&tcp)?;

        flush_socket(&tcp).await?;

        let runtime = tls::acquire();
        let stream = tls::negotiate(&runtime, tcp, &server_name).await?;
        info!("channel established with {server_name}");

        self.ctx.stream = Some(ChannelStream::Tls(stream));
        self.ctx.tls = Some(runtime);
        Ok(())
    }

    /// Tear down the TLS session state
    pub fn deinit(&mut self) {
        if self.ctx.stream.take().is_some() {
            debug!("destroying tls session");
        }
        if self.ctx.tls.take().is_some() {
            debug!("releasing tls runtime");
        }
    }

    /// Close the channel but keep the remembered staged address, so the
    /// next configure re-establishes in the same mode.
    pub fn reset(&mut self) {
        if let Some(stream) = self.ctx.stream.take() {
            debug!("closing channel socket");
            drop(stream);
        }
        self.ctx.tls.take();
    }

    /// Raw descriptor of the live channel, for callers that poll alongside
    /// the dispatch loop. `None` for other transport kinds or while no
    /// channel is up.
    pub fn get_socket(&self) -> Option<RawFd> {
        match self.kind {
            TransportKind::TcpTls => self.ctx.stream.as_ref().map(ChannelStream::as_raw_fd),
        }
    }

    /// The live channel stream
    pub(crate) fn stream(&self) -> Option<&ChannelStream> {
        self.ctx.stream.as_ref()
    }

    /// The live channel stream, mutably
    pub(crate) fn stream_mut(&mut self) -> Option<&mut ChannelStream> {
        self.ctx.stream.as_mut()
    }

    /// Note that a packet just arrived
    pub(crate) fn mark_packet(&mut self) {
        self.comms_last_packet = timebase::now_secs();
    }

    /// Install an already-established stream (tests drive the dispatch loop
    /// over plain loopback connections).
    #[cfg(test)]
    pub(crate) fn install_stream(&mut self, stream: ChannelStream) {
        self.ctx.stream = Some(stream);
    }
}

fn peer_name(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn set_no_inherit(tcp: &TcpStream) -> io::Result<()> {
    socket2::SockRef::from(tcp).set_cloexec(true)
}

/// Drain stager leftovers so stray bytes do not corrupt the TLS handshake.
///
/// Ticks a 1-second readability wait: readable data is consumed in 4096
/// byte bites; a full quiet tick, or the peer closing, ends the drain.
async fn flush_socket(tcp: &TcpStream) -> Result<(), SessionError> {
    let mut scratch = [0u8; 4096];
    loop {
        match tokio::time::timeout(FLUSH_TICK, tcp.readable()).await {
            Err(_) => break,
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(())) => match tcp.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    warn!("flushed {n} stager bytes from the channel");
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            },
        }
    }
    Ok(())
}
