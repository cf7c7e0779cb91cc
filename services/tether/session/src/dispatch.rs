//! The dispatch loop.
//!
//! Steady state: poll the channel in 50 ms ticks under the session lock,
//! receive one packet per readable tick, and hand it to the command
//! handler. The session ends on the terminate signal, idle timeout,
//! session expiry, peer close, or channel failure. The idle and expiry
//! checks run only on idle ticks, so a busy channel is never cut off
//! mid-packet; transmitters on other tasks interleave between ticks.

use std::time::Duration;

use tokio::io::Interest;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::frames;
use crate::remote::{Remote, Verdict};
use crate::timebase;
use crate::SessionError;

/// Poll granularity; bounds terminate-signal latency
pub const DISPATCH_TICK: Duration = Duration::from_millis(50);

enum Tick {
    Readable,
    Idle,
}

/// Run the dispatch loop until the session ends.
///
/// Clean endings (terminate signal, idle timeout, expiry, peer close, a
/// `Stop` verdict from the command handler) return `Ok`; channel failures
/// return the error so the outer supervisor can reset and re-establish.
/// The scheduler is brought up first and always torn down on the way out,
/// along with any outstanding command tasks.
pub async fn run(remote: &Remote, terminate: &watch::Receiver<bool>) -> Result<(), SessionError> {
    remote.scheduler().initialize(remote).await?;

    let (expiration_end, comms_timeout) = {
        let transport = remote.transport().lock().await;
        (transport.expiration_end(), transport.timeouts().comms)
    };
    let mut last_packet = timebase::now_secs();

    let result = loop {
        if *terminate.borrow() {
            debug!("dispatch signalled to terminate");
            break Ok(());
        }

        let tick = match poll_channel(remote).await {
            Ok(tick) => tick,
            Err(err) => {
                warn!("channel poll failed: {err}");
                break Err(err);
            }
        };

        match tick {
            Tick::Readable => {
                let received = {
                    let mut transport = remote.transport().lock().await;
                    let cipher = remote.cipher();
                    let result = match transport.stream_mut() {
                        None => Err(SessionError::NoChannel),
                        Some(stream) => frames::read_packet(stream, cipher.as_deref()).await,
                    };
                    if result.is_ok() {
                        transport.mark_packet();
                    }
                    result
                };

                match received {
                    Ok(packet) => {
                        // The handler runs outside the session lock so it can
                        // transmit responses itself.
                        match remote.commands().handle(remote, packet).await {
                            Ok(Verdict::Continue) => {}
                            Ok(Verdict::Stop) => {
                                debug!("command handler requested stop");
                                break Ok(());
                            }
                            Err(err) => {
                                warn!("command handler failed: {err}");
                                break Err(err);
                            }
                        }
                        last_packet = timebase::now_secs();
                    }
                    Err(SessionError::PeerClosed) => {
                        debug!("peer closed the channel, ending dispatch");
                        break Ok(());
                    }
                    Err(err) => {
                        warn!("packet receive failed: {err}");
                        break Err(err);
                    }
                }
            }
            Tick::Idle => {
                let now = timebase::now_secs();
                if now > expiration_end {
                    debug!("session expired, ending dispatch");
                    break Ok(());
                }
                if now - last_packet > comms_timeout {
                    debug!("communications idle timeout, ending dispatch");
                    break Ok(());
                }
            }
        }
    };

    debug!("dispatch tearing down scheduler and command tasks");
    remote.scheduler().destroy().await;
    remote.commands().join().await;

    result
}

/// One 50 ms readability poll, holding the session lock for its duration
async fn poll_channel(remote: &Remote) -> Result<Tick, SessionError> {
    let transport = remote.transport().lock().await;
    let stream = transport.stream().ok_or(SessionError::NoChannel)?;

    match tokio::time::timeout(DISPATCH_TICK, stream.tcp().ready(Interest::READABLE)).await {
        Ok(Ok(_ready)) => Ok(Tick::Readable),
        Ok(Err(err)) => Err(err.into()),
        Err(_elapsed) => Ok(Tick::Idle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::NullScheduler;
    use crate::testutil::{self, RecordingHandler, XorCipher};
    use crate::transport::{Timeouts, Transport};
    use std::sync::Arc;
    use std::time::Instant;
    use tether_wire::{Packet, HEADER_SIZE};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn timeouts(comms: u64) -> Timeouts {
        Timeouts {
            comms,
            retry_total: 5,
            retry_wait: 1,
            expiry: 60,
        }
    }

    async fn plain_remote(
        comms: u64,
        handler: Arc<RecordingHandler>,
    ) -> (Arc<Remote>, tokio::net::TcpStream) {
        let (transport, peer) = testutil::loopback_transport(timeouts(comms)).await;
        let remote = Arc::new(Remote::new(transport, handler, Arc::new(NullScheduler)));
        (remote, peer)
    }

    fn no_terminate() -> watch::Receiver<bool> {
        // A dropped sender leaves the last value readable, which is all the
        // dispatch loop looks at.
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_receives_packet_then_peer_close_ends_cleanly() {
        let handler = Arc::new(RecordingHandler::default());
        let (remote, mut peer) = plain_remote(10, handler.clone()).await;

        let writer = tokio::spawn(async move {
            let packet = Packet::new(0x0001, b"hello".to_vec());
            peer.write_all(&packet.encode()).await.unwrap();
            peer.flush().await.unwrap();
            // Closing the peer ends the session.
            drop(peer);
        });

        let result = run(&remote, &no_terminate()).await;
        assert!(result.is_ok());
        writer.await.unwrap();

        let seen = handler.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0x0001);
        assert_eq!(seen[0].1, b"hello");
    }

    #[tokio::test]
    async fn test_idle_timeout_window() {
        let handler = Arc::new(RecordingHandler::default());
        let (remote, _peer) = plain_remote(1, handler).await;

        let before = Instant::now();
        let result = run(&remote, &no_terminate()).await;
        let elapsed = before.elapsed().as_secs_f64();

        assert!(result.is_ok());
        // One comms second, plus tick granularity and whole-second rounding.
        assert!(elapsed >= 1.0, "returned too early: {elapsed}s");
        assert!(elapsed < 3.0, "idle timeout overstayed: {elapsed}s");
    }

    #[tokio::test]
    async fn test_terminate_signal_latency() {
        let handler = Arc::new(RecordingHandler::default());
        let (remote, _peer) = plain_remote(30, handler).await;

        let (tx, rx) = watch::channel(false);
        let before = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(true).unwrap();
        });

        let result = run(&remote, &rx).await;
        assert!(result.is_ok());
        assert!(before.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stop_verdict_ends_dispatch() {
        let handler = Arc::new(RecordingHandler::stopping_after(2));
        let (remote, mut peer) = plain_remote(30, handler.clone()).await;

        let writer = tokio::spawn(async move {
            for i in 0..3u8 {
                let packet = Packet::new(0x0001, vec![i]);
                peer.write_all(&packet.encode()).await.unwrap();
            }
            peer.flush().await.unwrap();
            // Hold the peer open; the Stop verdict must end the loop alone.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = run(&remote, &no_terminate()).await;
        assert!(result.is_ok());
        assert_eq!(handler.seen().len(), 2);
        writer.abort();
    }

    #[tokio::test]
    async fn test_packets_dispatch_in_arrival_order() {
        let handler = Arc::new(RecordingHandler::default());
        let (remote, mut peer) = plain_remote(10, handler.clone()).await;

        let writer = tokio::spawn(async move {
            for i in 0..5u8 {
                let packet = Packet::new(0x0001, vec![i]);
                peer.write_all(&packet.encode()).await.unwrap();
                peer.flush().await.unwrap();
            }
            drop(peer);
        });

        run(&remote, &no_terminate()).await.unwrap();
        writer.await.unwrap();

        let seen = handler.seen();
        let order: Vec<u8> = seen.iter().map(|(_, payload)| payload[0]).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_session_cipher_applied_before_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let (remote, mut peer) = plain_remote(10, handler.clone()).await;
        remote.set_cipher(Some(Arc::new(XorCipher(0x5A))));

        let writer = tokio::spawn(async move {
            let mut raw = Vec::new();
            raw.extend_from_slice(&0x0000_000Cu32.to_be_bytes());
            raw.extend_from_slice(&0x0042u32.to_le_bytes());
            raw.extend_from_slice(&[0x7A, 0x1F, 0x2B, 0xBB]);
            peer.write_all(&raw).await.unwrap();
            peer.flush().await.unwrap();
            drop(peer);
        });

        run(&remote, &no_terminate()).await.unwrap();
        writer.await.unwrap();

        let seen = handler.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0x0042);
        assert_eq!(seen[0].1, vec![0x20, 0x45, 0x71, 0xE1]);
    }

    #[tokio::test]
    async fn test_full_channel_over_tls() {
        // End to end: reverse connect, TLS, one packet, peer close.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = testutil::tls_serve_stream(tcp).await;
            let packet = Packet::new(0x0001, b"hello".to_vec());
            stream.write_all(&packet.encode()).await.unwrap();
            stream.flush().await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut transport = Transport::new(
            Some(format!("tcp://127.0.0.1:{port}")),
            timeouts(10),
        );
        transport.configure(None).await.unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let remote = Remote::new(transport, handler.clone(), Arc::new(NullScheduler));

        run(&remote, &no_terminate()).await.unwrap();
        server.await.unwrap();

        let seen = handler.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0x0001);
        assert_eq!(seen[0].1, b"hello");
        assert_eq!(seen[0].1.len() + HEADER_SIZE, 13);
    }
}
