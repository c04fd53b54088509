use crate::config::{Config, Direction, Protocol};
use crate::datagram::{self, DatagramServer};
use crate::measurements::{SessionCollector, TransferResult};
use crate::stream::{self, StreamServer};
use crate::Result;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

/// Transfer engine a [`SpeedTester`] is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// TCP throughput
    Stream,
    /// UDP latency and loss
    Datagram,
}

impl From<Protocol> for Engine {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => Engine::Stream,
            Protocol::Udp => Engine::Datagram,
        }
    }
}

/// Runs speed tests in either role using the engine chosen by the
/// configured protocol.
///
/// The engine is fixed at construction. Both roles stop when the tester's
/// cancellation token fires.
///
/// # Examples
///
/// ## Client
///
/// ```no_run
/// use netspeed::{Config, Direction, SpeedTester};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tester = SpeedTester::new(Config::client("192.168.1.100", 5000))?;
///
/// let result = tester.run_client_test(Direction::Download).await;
/// println!("Download speed: {:.2} Mbps", result.speed_mbps);
/// # Ok(())
/// # }
/// ```
///
/// ## Server with a shutdown timer
///
/// ```no_run
/// use netspeed::{Config, SpeedTester};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tester = SpeedTester::new(Config::server(5000))?;
///
/// let cancel = tester.cancellation_token().clone();
/// tokio::spawn(async move {
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     cancel.cancel();
/// });
///
/// tester.start_server().await?;
/// # Ok(())
/// # }
/// ```
pub struct SpeedTester {
    config: Config,
    engine: Engine,
    cancellation_token: CancellationToken,
    session: SessionCollector,
}

impl SpeedTester {
    /// Creates a tester, rejecting configurations the engines cannot run.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = Engine::from(config.protocol);
        debug!("Speed tester using {:?} engine for {}", engine, config.address());

        Ok(Self {
            config,
            engine,
            cancellation_token: CancellationToken::new(),
            session: SessionCollector::new(),
        })
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops a running server or client test.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Ledger of the datagram server's current session.
    ///
    /// Stays empty for the stream engine.
    pub fn session(&self) -> &SessionCollector {
        &self.session
    }

    /// Serves tests until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the listening socket cannot be bound. Failures of
    /// individual tests are logged and do not stop the server.
    pub async fn start_server(&self) -> Result<()> {
        info!(
            "Starting {} server on {}",
            self.config.protocol,
            self.config.address()
        );

        match self.engine {
            Engine::Stream => {
                let server = StreamServer::bind(self.config.clone()).await?;
                server.serve(&self.cancellation_token).await
            }
            Engine::Datagram => {
                let server = DatagramServer::bind(self.config.clone())
                    .await?
                    .with_session(self.session.clone());
                server.serve(&self.cancellation_token).await
            }
        }
    }

    /// Runs one test against the configured server.
    ///
    /// Always returns a result; a test that could not complete yields
    /// [`TransferResult::failed`].
    pub async fn run_client_test(&self, direction: Direction) -> TransferResult {
        match self.engine {
            Engine::Stream => {
                let mut result =
                    stream::run_client(&self.config, direction, &self.cancellation_token).await;
                result.stats = None;
                result
            }
            Engine::Datagram => {
                datagram::run_client(&self.config, direction, &self.cancellation_token).await
            }
        }
    }
}
