//! netspeed - A client/server network speed tester
//!
//! This library measures throughput between two hosts over TCP and latency,
//! jitter and packet loss over UDP. The same binary plays either role.
//!
//! # Features
//!
//! - TCP upload and download throughput with server-side timing
//! - UDP probe sessions reporting loss, round-trip times and jitter
//! - Cooperative shutdown through a cancellation token
//! - JSON output format
//! - Asynchronous I/O using tokio
//!
//! # Example
//!
//! ```no_run
//! use netspeed::{Config, Direction, SpeedTester};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tester = SpeedTester::new(Config::client("127.0.0.1", 5000))?;
//! let result = tester.run_client_test(Direction::Upload).await;
//! println!("{:.2} Mbps", result.speed_mbps);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod datagram;
pub mod error;
pub mod measurements;
pub mod protocol;
pub mod stream;
pub mod tester;

pub use config::{Config, Direction, Protocol};
pub use error::{Error, Result};
pub use measurements::{DatagramStats, TestReport, TransferResult};
pub use tester::{Engine, SpeedTester};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
