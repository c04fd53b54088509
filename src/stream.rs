//! Throughput tests over TCP.
//!
//! The server handles one connection at a time. Each connection carries a
//! single test: the client sends a 16-byte command frame, the payload moves
//! in the requested direction, and the server reports its own measurement in a
//! `STATS:<bytes>:<seconds>` frame. For downloads the frame is appended to the
//! payload, so the client locates it by inspecting the tail of the stream.

use crate::config::{Config, Direction};
use crate::error::with_timeout;
use crate::measurements::TransferResult;
use crate::protocol::{
    decode_command, encode_command, Command, StatsFrame, TrailerScanner, COMMAND_FRAME_LEN,
    MAX_STATS_FRAME_LEN,
};
use crate::{Error, Result};
use log::{debug, error, info, log, warn};
use rand::RngCore;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// How long an uploading client waits for the server's `STATS:` reply.
pub const STATS_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Listen backlog; one test is served at a time.
const LISTEN_BACKLOG: u32 = 1;

/// How a served connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Received `bytes` from the client
    Upload { bytes: u64, duration: f64 },
    /// Sent `bytes` to the client
    Download { bytes: u64, duration: f64 },
    /// The command token was not recognised; nothing was sent back
    UnknownCommand(String),
}

/// TCP test server.
///
/// # Examples
///
/// ```no_run
/// use netspeed::stream::StreamServer;
/// use netspeed::Config;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = StreamServer::bind(Config::server(5000)).await?;
/// let cancel = CancellationToken::new();
/// server.serve(&cancel).await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamServer {
    config: Config,
    listener: TcpListener,
}

impl StreamServer {
    /// Binds the listening socket with address reuse enabled.
    pub async fn bind(config: Config) -> Result<Self> {
        let addr = config.socket_addr().await?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves connections one at a time until `cancel` fires.
    ///
    /// Accept waits are bounded by the configured timeout so the token is
    /// re-checked even when no client shows up. Errors on a connection are
    /// logged and the server goes back to listening.
    pub async fn serve(&self, cancel: &CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!("TCP server started on {}", local);

        while !cancel.is_cancelled() {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = time::timeout(self.config.timeout, self.listener.accept()) => accepted,
            };

            let (stream, addr) = match accepted {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            info!("Connection from {}", addr);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Dropping connection from {} on shutdown", addr);
                    break;
                }
                outcome = handle_connection(stream, &self.config) => match outcome {
                    Ok(CommandOutcome::UnknownCommand(token)) => {
                        warn!("Ignoring unknown test type '{}' from {}", token, addr);
                    }
                    Ok(outcome) => debug!("Finished {:?} for {}", outcome, addr),
                    Err(e) => error!("Error handling client {}: {}", addr, e),
                },
            }
        }

        info!("TCP server on {} stopped", local);
        Ok(())
    }
}

/// Serves the single test carried by one connection.
///
/// The stream is dropped, and so closed, when this returns.
pub async fn handle_connection(mut stream: TcpStream, config: &Config) -> Result<CommandOutcome> {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    with_timeout(config.timeout, "command frame", stream.read_exact(&mut frame)).await?;

    let direction = match decode_command(&frame) {
        Command::Test(direction) => direction,
        Command::Unknown(token) => return Ok(CommandOutcome::UnknownCommand(token)),
    };

    match direction {
        Direction::Upload => {
            log!(config.detail_level(), "Starting upload test (receiving data)...");

            let mut buf = vec![0u8; config.buffer_size];
            let mut received = 0u64;
            let start = Instant::now();
            loop {
                let n =
                    with_timeout(config.timeout, "upload payload", stream.read(&mut buf)).await?;
                if n == 0 {
                    break;
                }
                received += n as u64;
            }
            let duration = start.elapsed().as_secs_f64();

            log!(
                config.detail_level(),
                "Received {} bytes in {:.2} seconds",
                received,
                duration
            );

            send_stats(&mut stream, StatsFrame::new(received, duration), config.timeout).await?;
            Ok(CommandOutcome::Upload {
                bytes: received,
                duration,
            })
        }
        Direction::Download => {
            log!(config.detail_level(), "Starting download test (sending data)...");

            let payload = random_payload(config.buffer_size);
            let start = Instant::now();
            let sent =
                write_payload(&mut stream, &payload, config.data_size, config.timeout).await?;
            let duration = start.elapsed().as_secs_f64();

            log!(
                config.detail_level(),
                "Sent {} bytes in {:.2} seconds",
                sent,
                duration
            );

            send_stats(&mut stream, StatsFrame::new(sent, duration), config.timeout).await?;
            Ok(CommandOutcome::Download {
                bytes: sent,
                duration,
            })
        }
    }
}

/// Runs one client test against the configured server.
///
/// Never fails: errors and cancellation are logged and reported as
/// [`TransferResult::failed`].
pub async fn run_client(
    config: &Config,
    direction: Direction,
    cancel: &CancellationToken,
) -> TransferResult {
    let attempt = async {
        match direction {
            Direction::Upload => upload(config).await,
            Direction::Download => download(config).await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Test("cancelled".to_string())),
        outcome = attempt => outcome,
    };

    match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Error during {} test: {}", direction, e);
            TransferResult::failed()
        }
    }
}

async fn upload(config: &Config) -> Result<TransferResult> {
    let mut stream = connect(config, Direction::Upload).await?;
    log!(
        config.detail_level(),
        "Starting upload test to {}...",
        config.address()
    );

    let payload = random_payload(config.buffer_size);
    let start = Instant::now();
    write_payload(&mut stream, &payload, config.data_size, config.timeout).await?;
    with_timeout(config.timeout, "closing write side", stream.shutdown()).await?;
    let local_duration = start.elapsed().as_secs_f64();

    let reply = read_stats_reply(&mut stream, STATS_REPLY_TIMEOUT).await;
    let (bytes, duration) = match reply.and_then(|data| StatsFrame::parse(&data)) {
        Ok(frame) => (frame.bytes, frame.duration),
        Err(e @ (Error::Timeout(_) | Error::ProtocolParse(_))) => {
            warn!("No usable STATS reply ({}); using local measurement", e);
            (config.data_size, local_duration)
        }
        Err(e) => return Err(e),
    };

    Ok(TransferResult::new(bytes, duration))
}

async fn download(config: &Config) -> Result<TransferResult> {
    let mut stream = connect(config, Direction::Download).await?;
    log!(
        config.detail_level(),
        "Starting download test from {}...",
        config.address()
    );

    let mut buf = vec![0u8; config.buffer_size];
    let mut scanner = TrailerScanner::new();
    let mut total = 0u64;
    let start = Instant::now();
    loop {
        let n = with_timeout(config.timeout, "download payload", stream.read(&mut buf)).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        scanner.push(&buf[..n]);
    }
    let local_duration = start.elapsed().as_secs_f64();

    let (bytes, duration) = match scanner.finish() {
        Some((frame, trailer_len)) => {
            debug!(
                "Received {} payload bytes, server reports {}",
                total.saturating_sub(trailer_len as u64),
                frame.bytes
            );
            (frame.bytes, frame.duration)
        }
        None => {
            warn!("Download ended without a STATS frame; using local measurement");
            (total, local_duration)
        }
    };

    Ok(TransferResult::new(bytes, duration))
}

async fn connect(config: &Config, direction: Direction) -> Result<TcpStream> {
    let address = config.address();
    let mut stream = with_timeout(config.timeout, "connect", TcpStream::connect(&address))
        .await
        .map_err(|e| match e {
            Error::Io(io) => Error::Connection(format!("{}: {}", address, io)),
            other => other,
        })?;
    debug!("Connected to {}", address);

    let frame = encode_command(direction);
    with_timeout(config.timeout, "command frame", stream.write_all(&frame)).await?;
    Ok(stream)
}

async fn send_stats(stream: &mut TcpStream, frame: StatsFrame, limit: Duration) -> Result<()> {
    with_timeout(limit, "STATS frame", stream.write_all(&frame.encode())).await?;
    with_timeout(limit, "STATS frame", stream.flush()).await?;
    with_timeout(limit, "closing stream", stream.shutdown()).await?;
    Ok(())
}

async fn read_stats_reply(stream: &mut TcpStream, limit: Duration) -> Result<Vec<u8>> {
    let mut reply = Vec::with_capacity(MAX_STATS_FRAME_LEN);
    let mut limited = (&mut *stream).take(MAX_STATS_FRAME_LEN as u64);
    with_timeout(limit, "STATS reply", limited.read_to_end(&mut reply)).await?;
    Ok(reply)
}

/// Fills a buffer of `size` pseudo-random bytes.
pub(crate) fn random_payload(size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

/// Writes exactly `total` bytes, cycling through slices of `payload`.
///
/// Each write is bounded by `limit`. Returns the number of bytes written.
pub async fn write_payload<W>(
    writer: &mut W,
    payload: &[u8],
    total: u64,
    limit: Duration,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() && total > 0 {
        return Err(Error::Config("payload buffer is empty".to_string()));
    }

    let mut remaining = total;
    while remaining > 0 {
        let chunk = remaining.min(payload.len() as u64) as usize;
        with_timeout(limit, "payload write", writer.write_all(&payload[..chunk])).await?;
        remaining -= chunk as u64;
    }
    with_timeout(limit, "payload flush", writer.flush()).await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_payload_exact_total() {
        let payload = random_payload(8192);
        for total in [0u64, 1, 8191, 8192, 8193, 1_048_576, 1_000_003] {
            let mut sink: Vec<u8> = Vec::new();
            let written = write_payload(&mut sink, &payload, total, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(written, total);
            assert_eq!(sink.len() as u64, total);
        }
    }

    #[tokio::test]
    async fn test_write_payload_cycles_buffer() {
        let payload = vec![1u8, 2, 3];
        let mut sink: Vec<u8> = Vec::new();
        write_payload(&mut sink, &payload, 7, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sink, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn test_write_payload_rejects_empty_buffer() {
        let mut sink: Vec<u8> = Vec::new();
        let result = write_payload(&mut sink, &[], 10, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_random_payload_size() {
        assert_eq!(random_payload(8192).len(), 8192);
        assert!(random_payload(0).is_empty());
    }
}
