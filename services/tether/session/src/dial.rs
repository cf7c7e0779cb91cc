//! Socket bring-up for the command channel.
//!
//! Reverse mode dials the controller; bind mode listens for exactly one
//! inbound controller connection and closes the listener as soon as it has
//! accepted. All outbound paths share one retry contract bounded by the
//! retry window and the absolute session deadline.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::timebase;
use crate::SessionError;

/// Retry policy for outbound connects
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Outer window in seconds; attempts stop once it is exhausted
    pub total: u64,
    /// Seconds to sleep between attempts
    pub wait: u64,
    /// Absolute session deadline in timebase seconds
    pub expires_at: u64,
}

/// Run connect attempts under the shared retry contract.
///
/// At least one attempt is always made. After a failed attempt the session
/// deadline is checked first, then the loop sleeps `wait` seconds and keeps
/// going while the window since the first attempt is open. The last attempt
/// error is surfaced when the window closes.
async fn connect_with_retry<F, Fut>(
    policy: RetryPolicy,
    mut attempt: F,
) -> Result<TcpStream, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    let started = timebase::now_secs();
    loop {
        match attempt().await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if timebase::now_secs() >= policy.expires_at {
                    debug!("session deadline passed while connecting: {err}");
                    return Err(SessionError::Expired);
                }
                debug!("connect failed ({err}), sleeping {}s", policy.wait);
                timebase::sleep_secs(policy.wait).await;
                if timebase::now_secs() - started >= policy.total {
                    return Err(SessionError::RetryExhausted(err));
                }
            }
        }
    }
}

/// Dial an IPv4 controller, retrying inside the policy window.
///
/// Name resolution failure is a retry condition like any other connect
/// error, so a controller that comes up late in the window is still
/// reached.
pub async fn reverse_v4(
    host: &str,
    port: u16,
    policy: RetryPolicy,
) -> Result<TcpStream, SessionError> {
    connect_with_retry(policy, || async move {
        let mut addrs = lookup_host((host, port)).await?;
        let addr = addrs
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no ipv4 address"))?;
        TcpStream::connect(addr).await
    })
    .await
}

/// Dial an IPv6 controller, retrying inside the policy window.
///
/// Every resolved candidate gets the interface scope id stamped on it
/// before the attempt; the first successful connect wins.
pub async fn reverse_v6(
    host: &str,
    port: u16,
    scope_id: Option<u32>,
    policy: RetryPolicy,
) -> Result<TcpStream, SessionError> {
    connect_with_retry(policy, || async move {
        let addrs: Vec<SocketAddrV6> = lookup_host((host, port))
            .await?
            .filter_map(|addr| match addr {
                SocketAddr::V6(v6) => Some(v6),
                SocketAddr::V4(_) => None,
            })
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no ipv6 address"));
        }

        let mut last = io::Error::new(io::ErrorKind::NotFound, "no ipv6 address");
        for mut addr in addrs {
            if let Some(scope) = scope_id {
                addr.set_scope_id(scope);
            }
            match TcpStream::connect(SocketAddr::V6(addr)).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last = err,
            }
        }
        Err(last)
    })
    .await
}

/// Reconnect to a remembered peer address, retrying inside the policy window
pub async fn reconnect(addr: SocketAddr, policy: RetryPolicy) -> Result<TcpStream, SessionError> {
    connect_with_retry(policy, || TcpStream::connect(addr)).await
}

/// Listen for exactly one inbound controller connection.
///
/// Prefers a dual-stack IPv6 listener and falls back to pure IPv4 when the
/// v6 socket cannot be created or `IPV6_V6ONLY` cannot be cleared. The
/// listener is closed before the accepted stream is returned, so nothing
/// stays bound to the port.
pub async fn bind_listen(port: u16) -> Result<TcpStream, SessionError> {
    let listener = dual_stack_listener(port)?;
    let (stream, peer) = listener.accept().await?;
    debug!("accepted controller connection from {peer}");
    drop(listener);
    Ok(stream)
}

/// Re-listen on a remembered listener address and accept one peer
pub async fn rebind(addr: SocketAddr) -> Result<TcpStream, SessionError> {
    let listener = listener_on(addr.into(), Domain::for_address(addr))?;
    let (stream, peer) = listener.accept().await?;
    debug!("accepted controller reconnection from {peer}");
    drop(listener);
    Ok(stream)
}

fn dual_stack_listener(port: u16) -> io::Result<TcpListener> {
    match ipv6_any_listener(port) {
        Ok(listener) => Ok(listener),
        Err(err) => {
            warn!("ipv6 listener unavailable ({err}), falling back to ipv4");
            listener_on(
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into(),
                Domain::IPV4,
            )
        }
    }
}

fn ipv6_any_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    finish_listener(socket, SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())
}

fn listener_on(addr: socket2::SockAddr, domain: Domain) -> io::Result<TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    finish_listener(socket, addr)
}

fn finish_listener(socket: Socket, addr: socket2::SockAddr) -> io::Result<TcpListener> {
    socket.set_reuse_address(true)?;
    socket.bind(&addr)?;
    // One controller connection; anything beyond that is noise.
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn free_port() -> u16 {
        // Bind an ephemeral listener, note the port, release it. Racy in
        // principle, fine on a loopback test host.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_retry_window_bound() {
        let port = free_port();
        let policy = RetryPolicy {
            total: 1,
            wait: 1,
            expires_at: timebase::now_secs() + 60,
        };

        let before = Instant::now();
        let result = reverse_v4("127.0.0.1", port, policy).await;
        let elapsed = before.elapsed().as_secs_f64();

        assert!(matches!(result, Err(SessionError::RetryExhausted(_))));
        // Window plus one sleep, with scheduling slack.
        assert!(elapsed < 3.0, "retry loop overstayed: {elapsed}s");
    }

    #[tokio::test]
    async fn test_expiry_dominates_retry_window() {
        let port = free_port();
        let policy = RetryPolicy {
            total: 30,
            wait: 1,
            expires_at: timebase::now_secs() + 1,
        };

        let before = Instant::now();
        let result = reverse_v4("127.0.0.1", port, policy).await;
        let elapsed = before.elapsed().as_secs_f64();

        assert!(matches!(result, Err(SessionError::Expired)));
        assert!(elapsed < 3.0, "expiry ignored: {elapsed}s");
    }

    #[tokio::test]
    async fn test_lookup_failure_is_retried() {
        let policy = RetryPolicy {
            total: 1,
            wait: 1,
            expires_at: timebase::now_secs() + 60,
        };
        let result = reverse_v4("host.invalid", 4444, policy).await;
        assert!(matches!(result, Err(SessionError::RetryExhausted(_))));
    }

    #[tokio::test]
    async fn test_reverse_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let policy = RetryPolicy {
            total: 5,
            wait: 1,
            expires_at: timebase::now_secs() + 60,
        };
        let stream = reverse_v4("127.0.0.1", addr.port(), policy).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_accepts_one_and_closes_listener() {
        let port = free_port();

        let accept = tokio::spawn(async move { bind_listen(port).await });
        // Give the listener a moment to come up, then dial it.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let accepted = accept.await.unwrap().unwrap();
        // The dual-stack listener reports the v4 peer as a mapped address;
        // the port is the stable part to compare.
        assert_eq!(
            accepted.peer_addr().unwrap().port(),
            client.local_addr().unwrap().port()
        );

        // Nothing may stay bound to the port once the peer is accepted.
        let refused = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(refused.is_err(), "listener survived bind_listen");
    }

    #[tokio::test]
    async fn test_rebind_reuses_listener_address() {
        let port = free_port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let accept = tokio::spawn(async move { rebind(addr).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let client = TcpStream::connect(addr).await.unwrap();
        let accepted = accept.await.unwrap().unwrap();
        assert_eq!(
            accepted.peer_addr().unwrap(),
            client.local_addr().unwrap()
        );
    }
}
