//! Latency and loss measurement over UDP.
//!
//! UDP gives no delivery or ordering guarantees, so the test runs its own
//! small session protocol (see [`crate::protocol::Message`]): the client opens
//! a session, fires a bounded number of sequence-numbered probes, collects one
//! acknowledgment per probe within a short window, and derives loss and
//! round-trip figures from which acknowledgments came back.

use crate::config::{Config, Direction, UDP_PACKET_SIZE};
use crate::error::with_timeout;
use crate::measurements::{unix_time_secs, PacketLedger, SessionCollector, TransferResult};
use crate::protocol::Message;
use crate::{Error, Result};
use log::{debug, error, info, log, warn};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Wait for each acknowledgment once all probes are out.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Receive timeout of the server loop; bounds shutdown latency.
pub const SERVER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A pause is inserted after every this many probes.
pub const PACE_EVERY: u64 = 50;

/// Length of the pause between probe bursts.
pub const PACE_PAUSE: Duration = Duration::from_millis(10);

/// Receive buffer of the client; session messages are far smaller.
const CLIENT_RECV_LEN: usize = 1024;

/// Smallest receive buffer the server uses whatever the configured size.
const MIN_SERVER_RECV_LEN: usize = 64;

/// UDP test server.
///
/// Serves one session at a time from a single receive loop. The probe ledger
/// of the current session is kept in a [`SessionCollector`] that callers can
/// share to observe the server.
pub struct DatagramServer {
    config: Config,
    socket: UdpSocket,
    session: SessionCollector,
}

impl DatagramServer {
    pub async fn bind(config: Config) -> Result<Self> {
        let addr = config.socket_addr().await?;
        let socket = UdpSocket::bind(addr).await?;

        Ok(Self {
            config,
            socket,
            session: SessionCollector::new(),
        })
    }

    /// Records sessions into `session` instead of a private collector.
    pub fn with_session(mut self, session: SessionCollector) -> Self {
        self.session = session;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session(&self) -> &SessionCollector {
        &self.session
    }

    /// Receives and answers datagrams until `cancel` fires.
    pub async fn serve(&self, cancel: &CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!("UDP server started on {}", local);

        let mut buf = vec![0u8; self.config.buffer_size.max(MIN_SERVER_RECV_LEN)];

        while !cancel.is_cancelled() {
            let poll = time::timeout(SERVER_POLL_INTERVAL, self.socket.recv_from(&mut buf));
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = poll => received,
            };

            let (len, peer) = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("Error receiving datagram: {}", e);
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            if let Err(e) = self.handle_datagram(&buf[..len], peer).await {
                match &e {
                    Error::ProtocolParse(_) => debug!("Ignoring datagram from {}: {}", peer, e),
                    _ => error!("Error answering {}: {}", peer, e),
                }
            }
        }

        info!("UDP server on {} stopped", local);
        Ok(())
    }

    async fn handle_datagram(&self, data: &[u8], peer: SocketAddr) -> Result<()> {
        match Message::parse(data)? {
            Message::Start(direction) => {
                log!(
                    self.config.detail_level(),
                    "Starting UDP {} test with {}",
                    direction,
                    peer
                );
                self.session.reset(direction);
                self.reply(&Message::Ready, peer).await
            }
            Message::Seq { seq, sent_at } => {
                self.session.record_probe(seq, sent_at, unix_time_secs());
                let ack = Message::Ack {
                    seq,
                    server_time: unix_time_secs(),
                };
                self.reply(&ack, peer).await
            }
            Message::End => {
                let count = self.session.finish();
                log!(
                    self.config.detail_level(),
                    "UDP test complete, received {} packets",
                    count
                );
                self.reply(&Message::Results { count }, peer).await
            }
            other => {
                debug!("Ignoring unexpected '{}' from {}", other, peer);
                Ok(())
            }
        }
    }

    async fn reply(&self, msg: &Message, peer: SocketAddr) -> Result<()> {
        self.socket.send_to(&msg.encode(), peer).await?;
        Ok(())
    }
}

/// Runs one client measurement against the configured server.
///
/// Never fails: errors and cancellation are logged and reported as
/// [`TransferResult::failed`].
pub async fn run_client(
    config: &Config,
    direction: Direction,
    cancel: &CancellationToken,
) -> TransferResult {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Test("cancelled".to_string())),
        outcome = measure(config, direction) => outcome,
    };

    match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Error during UDP {} test: {}", direction, e);
            TransferResult::failed()
        }
    }
}

async fn measure(config: &Config, direction: Direction) -> Result<TransferResult> {
    let server = config.socket_addr().await?;
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;

    let mut buf = [0u8; CLIENT_RECV_LEN];

    socket.send(&Message::Start(direction).encode()).await?;
    let len = with_timeout(config.timeout, "waiting for READY", socket.recv(&mut buf)).await?;
    match Message::parse(&buf[..len])? {
        Message::Ready => {}
        other => {
            return Err(Error::Protocol(format!("expected READY, got '{}'", other)));
        }
    }

    log!(
        config.detail_level(),
        "Starting UDP {} test with {}",
        direction,
        server
    );

    let num_packets = config.udp_packet_count();
    let mut ledger = PacketLedger::new();
    let start = Instant::now();

    for seq in 0..num_packets {
        let probe = Message::Seq {
            seq,
            sent_at: unix_time_secs(),
        };
        let sent_at = Instant::now();
        socket.send(&probe.encode()).await?;
        ledger.record_sent(seq, sent_at);

        if seq > 0 && seq % PACE_EVERY == 0 {
            time::sleep(PACE_PAUSE).await;
        }
    }

    for _ in 0..num_packets {
        let len = match time::timeout(ACK_TIMEOUT, socket.recv(&mut buf)).await {
            Err(_) => continue,
            Ok(result) => result?,
        };
        let received_at = Instant::now();

        match Message::parse(&buf[..len]) {
            Ok(Message::Ack { seq, server_time }) => {
                if !ledger.record_ack(seq, server_time, received_at) {
                    debug!("ACK for unknown sequence {}", seq);
                }
            }
            Ok(other) => debug!("Ignoring '{}' while collecting ACKs", other),
            Err(e) => debug!("Ignoring reply: {}", e),
        }
    }

    let duration = start.elapsed().as_secs_f64();

    if let Err(e) = socket.send(&Message::End.encode()).await {
        warn!("Failed to send END: {}", e);
    }

    let stats = ledger.summarize();
    log!(
        config.detail_level(),
        "{} of {} probes acknowledged ({:.2}% loss)",
        stats.packets_received,
        stats.packets_sent,
        stats.packet_loss
    );

    let bytes_sent = num_packets * UDP_PACKET_SIZE;
    Ok(TransferResult::new(bytes_sent, duration).with_stats(stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> Config {
        Config::client("127.0.0.1", port)
            .with_protocol(crate::Protocol::Udp)
            .with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_server_answers_session_messages() {
        let server = DatagramServer::bind(loopback(0)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let session = server.session().clone();
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move { server.serve(&serve_cancel).await });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();
        let mut buf = [0u8; 128];

        socket.send(b"START:upload").await.unwrap();
        let n = socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"READY");

        socket.send(b"SEQ:0:100.5").await.unwrap();
        let n = socket.recv(&mut buf).await.unwrap();
        match Message::parse(&buf[..n]).unwrap() {
            Message::Ack { seq, server_time } => {
                assert_eq!(seq, 0);
                assert!(server_time > 0.0);
            }
            other => panic!("expected ACK, got {:?}", other),
        }
        assert_eq!(session.probe(0).map(|p| p.client_time), Some(100.5));

        // Malformed datagrams are ignored, the session keeps going
        socket.send(b"SEQ:oops").await.unwrap();
        socket.send(b"END").await.unwrap();
        let n = socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"RESULTS:1");

        let snapshot = session.snapshot();
        assert_eq!(snapshot.direction, Some(Direction::Upload));
        assert_eq!(snapshot.packets_received, 1);
        assert!(snapshot.finished);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_resets_server_ledger() {
        let server = DatagramServer::bind(loopback(0)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let session = server.session().clone();
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move { server.serve(&serve_cancel).await });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();
        let mut buf = [0u8; 128];

        socket.send(b"START:download").await.unwrap();
        socket.recv(&mut buf).await.unwrap();
        for seq in 0..3 {
            socket
                .send(format!("SEQ:{}:1.0", seq).as_bytes())
                .await
                .unwrap();
            socket.recv(&mut buf).await.unwrap();
        }
        assert_eq!(session.snapshot().packets_received, 3);

        socket.send(b"START:upload").await.unwrap();
        let n = socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"READY");
        assert_eq!(session.snapshot().packets_received, 0);
        assert!(session.probe(2).is_none());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
