use clap::{ArgGroup, Parser};
use netspeed::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_DATA_SIZE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT,
};
use netspeed::measurements::format_size;
use netspeed::{Config, Direction, Protocol, SpeedTester, TestReport, TransferResult};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netspeed")]
#[command(about = "Network speed tester - TCP throughput and UDP latency/loss", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["server", "client"])))]
struct Cli {
    /// Run in server mode
    #[arg(short, long)]
    server: bool,

    /// Run in client mode
    #[arg(short, long)]
    client: bool,

    /// Host address
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port number
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Buffer size in bytes
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer: usize,

    /// Data size in bytes
    #[arg(short, long, default_value_t = DEFAULT_DATA_SIZE)]
    data_size: u64,

    /// Timeout in seconds
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Protocol to use
    #[arg(short = 'P', long, default_value = "tcp", value_parser = ["tcp", "udp"])]
    protocol: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output in JSON format
    #[arg(short = 'J', long)]
    json: bool,

    /// Test download speed
    #[arg(long)]
    download: bool,

    /// Test upload speed
    #[arg(long)]
    upload: bool,

    /// Test both download and upload speeds
    #[arg(long)]
    both: bool,
}

impl Cli {
    /// Tests to run in client mode, download first. Defaults to both.
    fn directions(&self) -> Vec<Direction> {
        let all = self.both || !(self.download || self.upload);
        let mut directions = Vec::new();
        if all || self.download {
            directions.push(Direction::Download);
        }
        if all || self.upload {
            directions.push(Direction::Upload);
        }
        directions
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let protocol: Protocol = cli.protocol.parse()?;
    let config = Config::client(cli.host.clone(), cli.port)
        .with_buffer_size(cli.buffer)
        .with_data_size(cli.data_size)
        .with_timeout(Duration::from_secs(cli.timeout))
        .with_protocol(protocol)
        .with_verbose(cli.verbose)
        .with_json(cli.json);

    let tester = SpeedTester::new(config)?;

    let cancel = tester.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if cli.server {
        tester.start_server().await?;
        return Ok(());
    }

    let json = tester.config().json;
    if !json {
        println!(
            "Connecting to {} using {}...",
            tester.config().address(),
            protocol.to_string().to_uppercase()
        );
    }

    let mut failures = 0;
    for direction in cli.directions() {
        if tester.cancellation_token().is_cancelled() {
            break;
        }
        if !json {
            println!("\nTesting {} speed...", direction);
        }

        let result = tester.run_client_test(direction).await;
        if result.is_failed() {
            failures += 1;
        }

        if json {
            let report = TestReport::new(protocol, direction, result);
            println!("{}", report.to_json()?);
        } else {
            print_result(direction, &result);
        }
    }

    if tester.cancellation_token().is_cancelled() {
        println!("\nExiting...");
        return Ok(());
    }
    if failures > 0 {
        anyhow::bail!("{} test(s) failed", failures);
    }
    Ok(())
}

fn print_result(direction: Direction, result: &TransferResult) {
    if result.is_failed() {
        println!("{} test failed", capitalize(direction.as_str()));
        return;
    }

    let moved = match direction {
        Direction::Download => "received",
        Direction::Upload => "sent",
    };
    println!(
        "{} speed: {:.2} Mbps",
        capitalize(direction.as_str()),
        result.speed_mbps
    );
    println!("Data {}: {}", moved, format_size(result.bytes));
    println!("Duration: {:.2} seconds", result.duration);

    if let Some(stats) = &result.stats {
        println!("Packet loss: {:.2}%", stats.packet_loss);
        println!("Average RTT: {:.2} ms", stats.avg_rtt_ms);
        println!("Jitter: {:.2} ms", stats.jitter_ms);
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
