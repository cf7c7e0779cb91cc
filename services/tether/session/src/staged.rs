//! Staged-socket adoption.
//!
//! A connected socket inherited from a bootstrap stage arrives with no
//! record of how it was created. To re-establish in the same mode after a
//! failure, the channel probes nearby descriptors for the listener that
//! would have accepted it: finding one means the stage bound locally, so
//! the listener is closed (the stage never cleans it up) and its address
//! remembered; finding none means the stage dialed out, so the peer
//! address is remembered instead.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};

use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Number of sibling descriptors probed below the adopted one
const SIBLING_SCAN: RawFd = 16;

/// Descriptor spacing on this platform (Windows spaces handles by 4)
const SIBLING_STRIDE: RawFd = 1;

/// What the inference concluded about the staged connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedOrigin {
    /// True when the connection came in through a local listener
    pub bound: bool,
    /// Listener address (bound) or peer address (reverse) to re-establish with
    pub sock_desc: Option<SocketAddr>,
}

/// Inspect an adopted descriptor and work out how it was created.
///
/// Always concludes something: when no candidate is a valid listening
/// socket the connection is treated as reverse. A candidate counts as the
/// original listener when it is listening, shares the adopted socket's
/// address family, and sits on the same local port; the scan runs in
/// ascending distance and the first match wins.
pub fn infer_origin(fd: RawFd) -> StagedOrigin {
    let borrow = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&borrow);

    let Some(local) = sock.local_addr().ok().and_then(|addr| addr.as_socket()) else {
        // Not an inet socket we can reason about; all that is left is the peer.
        return reverse_origin(fd);
    };

    for step in 1..=SIBLING_SCAN {
        let candidate = fd - step * SIBLING_STRIDE;
        if candidate < 0 {
            break;
        }

        trace!("probing descriptor {candidate} for a stage listener");
        let borrow = unsafe { BorrowedFd::borrow_raw(candidate) };
        let cand = SockRef::from(&borrow);

        // Skip anything that is not a listening socket, including
        // descriptors the probe cannot query at all.
        if !matches!(cand.is_listener(), Ok(true)) {
            continue;
        }
        let Some(cand_addr) = cand.local_addr().ok().and_then(|addr| addr.as_socket()) else {
            continue;
        };
        if cand_addr.is_ipv4() != local.is_ipv4() {
            continue;
        }
        if cand_addr.port() != local.port() {
            continue;
        }

        debug!("stage listener found on descriptor {candidate} ({cand_addr})");
        drop(unsafe { OwnedFd::from_raw_fd(candidate) });
        return StagedOrigin {
            bound: true,
            sock_desc: Some(cand_addr),
        };
    }

    reverse_origin(fd)
}

fn reverse_origin(fd: RawFd) -> StagedOrigin {
    let borrow = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&borrow);
    let peer = sock.peer_addr().ok().and_then(|addr| addr.as_socket());
    debug!("staged connection treated as reverse (peer {peer:?})");
    StagedOrigin {
        bound: false,
        sock_desc: peer,
    }
}

/// Take ownership of an inherited descriptor as a tokio stream.
///
/// The descriptor is marked close-on-exec so command child processes do not
/// inherit the channel.
pub fn adopt_stream(fd: RawFd) -> io::Result<TcpStream> {
    let socket = socket2::Socket::from(unsafe { OwnedFd::from_raw_fd(fd) });
    socket.set_cloexec(true)?;
    socket.set_nonblocking(true)?;
    TcpStream::from_std(socket.into())
}
