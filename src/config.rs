use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default host the server binds to and the client connects to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port for both transports.
pub const DEFAULT_PORT: u16 = 5000;

/// Default bytes moved per I/O operation.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default payload volume for a stream test (10 MiB).
pub const DEFAULT_DATA_SIZE: u64 = 10 * 1024 * 1024;

/// Default bound on blocking channel operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the number of probes in one datagram test.
pub const DEFAULT_UDP_PACKETS: u64 = 1000;

/// Nominal size of one datagram probe.
///
/// This is fixed and does not follow `buffer_size`: both peers derive the
/// probe count from it, so changing it breaks interoperability.
pub const UDP_PACKET_SIZE: u64 = 1024;

/// Transport used for a test.
///
/// # Examples
///
/// ```
/// use netspeed::Protocol;
///
/// let protocol: Protocol = "udp".parse().unwrap();
/// assert_eq!(protocol, Protocol::Udp);
/// assert_eq!(protocol.to_string(), "udp");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Reliable, ordered byte stream
    Tcp,
    /// Connectionless, best-effort datagrams
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::Config(format!("unknown protocol '{}'", other))),
        }
    }
}

/// Direction of a transfer, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends, server receives
    Upload,
    /// Server sends, client receives
    Download,
}

impl Direction {
    /// The token used for this direction on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Direction::Upload),
            "download" => Ok(Direction::Download),
            other => Err(Error::Protocol(format!("unknown test type '{}'", other))),
        }
    }
}

/// Configuration for one speed test, shared by the server and client roles.
///
/// Built once and read-only afterwards. Use the builder methods to override
/// individual defaults.
///
/// # Examples
///
/// ```
/// use netspeed::{Config, Protocol};
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100", 5000)
///     .with_protocol(Protocol::Udp)
///     .with_data_size(1024 * 1024)
///     .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.port, 5000);
/// assert_eq!(config.udp_packet_count(), 1000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind (server) or connect to (client)
    pub host: String,

    /// Port number
    pub port: u16,

    /// Bytes per I/O operation
    pub buffer_size: usize,

    /// Total bytes to move in a stream test
    pub data_size: u64,

    /// Bound applied to blocking channel operations
    pub timeout: Duration,

    /// Transport (TCP or UDP)
    pub protocol: Protocol,

    /// Emit per-test detail at info level
    pub verbose: bool,

    /// Output in JSON format
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            data_size: DEFAULT_DATA_SIZE,
            timeout: DEFAULT_TIMEOUT,
            protocol: Protocol::Tcp,
            verbose: false,
            json: false,
        }
    }
}

impl Config {
    /// Creates a configuration with every default value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server configuration listening on `port` of the default host.
    pub fn server(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Creates a client configuration targeting `host:port`.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the number of bytes moved per read or write.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the payload volume. For UDP tests this only caps the probe count.
    pub fn with_data_size(mut self, size: u64) -> Self {
        self.data_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// `host:port` as used for binding and connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolves [`Config::address`] to the first matching socket address.
    pub async fn socket_addr(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host(self.address())
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve '{}'", self.address())))
    }

    /// Number of probes a datagram test sends.
    pub fn udp_packet_count(&self) -> u64 {
        DEFAULT_UDP_PACKETS.min(self.data_size / UDP_PACKET_SIZE)
    }

    /// Log level for per-test progress messages.
    pub fn detail_level(&self) -> log::Level {
        if self.verbose {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    /// Checks the values the engines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer size must be positive".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }
}
