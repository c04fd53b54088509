//! Timing, statistics and result types.

use crate::config::{Direction, Protocol};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as seconds since the UNIX epoch.
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Throughput in Mbps using binary megabits: `bytes * 8 / (1024 * 1024 * secs)`.
///
/// Returns 0 for a non-positive duration.
///
/// # Examples
///
/// ```
/// use netspeed::measurements::speed_mbps;
///
/// assert_eq!(speed_mbps(1024 * 1024, 1.0), 8.0);
/// assert_eq!(speed_mbps(1024, 0.0), 0.0);
/// ```
pub fn speed_mbps(bytes: u64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        (bytes as f64 * 8.0) / (1024.0 * 1024.0 * duration_secs)
    } else {
        0.0
    }
}

/// Summary of a set of samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation (n - 1); 0 with fewer than two samples
    pub std_dev: f64,
}

impl SampleStats {
    /// Describes `samples`, or `None` if there are none.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let mean = samples.iter().sum::<f64>() / count as f64;
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std_dev = if count > 1 {
            let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Some(Self {
            count,
            mean,
            min,
            max,
            std_dev,
        })
    }
}

/// Latency and loss figures of a datagram test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatagramStats {
    /// Percentage of probes without a matching acknowledgment
    pub packet_loss: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    /// Sample standard deviation of the round-trip times
    pub jitter_ms: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

/// Outcome of one client test.
///
/// A test that failed is reported as the all-zero result rather than an
/// error; check [`TransferResult::is_failed`] before treating the numbers as
/// a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub speed_mbps: f64,
    /// Wall-clock seconds
    pub duration: f64,
    pub bytes: u64,
    /// Present for datagram tests only
    pub stats: Option<DatagramStats>,
}

impl TransferResult {
    /// Builds a result, deriving the speed from `bytes` and `duration`.
    pub fn new(bytes: u64, duration: f64) -> Self {
        Self {
            speed_mbps: speed_mbps(bytes, duration),
            duration,
            bytes,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: DatagramStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// The result reported when a test could not complete.
    pub fn failed() -> Self {
        Self {
            speed_mbps: 0.0,
            duration: 0.0,
            bytes: 0,
            stats: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.bytes == 0 && self.duration == 0.0 && self.speed_mbps == 0.0
    }
}

/// Acknowledgment as seen by the client.
#[derive(Debug, Clone, Copy)]
pub struct AckRecord {
    /// Time the server stamped on the `ACK`
    pub server_time: f64,
    /// Local instant the `ACK` arrived
    pub received_at: Instant,
}

/// Client-side record of probe send times and acknowledgment arrivals.
///
/// Round-trip times use the client's own monotonic clock on both ends, so
/// clock skew between hosts does not enter the figures.
#[derive(Debug, Default)]
pub struct PacketLedger {
    sent: BTreeMap<u64, Instant>,
    received: BTreeMap<u64, AckRecord>,
}

impl PacketLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, seq: u64, at: Instant) {
        self.sent.insert(seq, at);
    }

    /// Records an acknowledgment. Returns `false` and ignores it when `seq`
    /// was never sent.
    pub fn record_ack(&mut self, seq: u64, server_time: f64, received_at: Instant) -> bool {
        if !self.sent.contains_key(&seq) {
            return false;
        }
        self.received.insert(
            seq,
            AckRecord {
                server_time,
                received_at,
            },
        );
        true
    }

    pub fn packets_sent(&self) -> u64 {
        self.sent.len() as u64
    }

    pub fn packets_received(&self) -> u64 {
        self.received.len() as u64
    }

    pub fn ack(&self, seq: u64) -> Option<&AckRecord> {
        self.received.get(&seq)
    }

    /// Round-trip times in milliseconds, in sequence order.
    pub fn rtt_samples_ms(&self) -> Vec<f64> {
        self.received
            .iter()
            .filter_map(|(seq, ack)| {
                self.sent.get(seq).map(|sent_at| {
                    ack.received_at.saturating_duration_since(*sent_at).as_secs_f64() * 1000.0
                })
            })
            .collect()
    }

    /// Derives the loss and latency figures.
    pub fn summarize(&self) -> DatagramStats {
        let sent = self.packets_sent();
        let received = self.packets_received();
        let packet_loss = if sent > 0 {
            (1.0 - received as f64 / sent as f64) * 100.0
        } else {
            0.0
        };

        let rtts = self.rtt_samples_ms();
        let summary = SampleStats::from_samples(&rtts);

        DatagramStats {
            packet_loss,
            min_rtt_ms: summary.map(|s| s.min).unwrap_or(0.0),
            max_rtt_ms: summary.map(|s| s.max).unwrap_or(0.0),
            avg_rtt_ms: summary.map(|s| s.mean).unwrap_or(0.0),
            jitter_ms: summary.map(|s| s.std_dev).unwrap_or(0.0),
            packets_sent: sent,
            packets_received: received,
        }
    }
}

/// Server-side timing of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeTiming {
    /// Send time reported by the client
    pub client_time: f64,
    /// Arrival time on the server
    pub server_time: f64,
}

/// Snapshot of the server's most recent datagram session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub direction: Option<Direction>,
    pub packets_received: u64,
    pub finished: bool,
}

#[derive(Debug, Default)]
struct SessionLedger {
    direction: Option<Direction>,
    probes: BTreeMap<u64, ProbeTiming>,
    finished: bool,
}

/// Thread-safe record of the server's current datagram session.
///
/// The probe map is cleared at every session start and never carried over.
#[derive(Debug, Clone, Default)]
pub struct SessionCollector {
    inner: Arc<Mutex<SessionLedger>>,
}

impl SessionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new session, discarding the previous one.
    pub fn reset(&self, direction: Direction) {
        let mut ledger = self.inner.lock();
        ledger.direction = Some(direction);
        ledger.probes.clear();
        ledger.finished = false;
    }

    pub fn record_probe(&self, seq: u64, client_time: f64, server_time: f64) {
        self.inner.lock().probes.insert(
            seq,
            ProbeTiming {
                client_time,
                server_time,
            },
        );
    }

    /// Marks the session closed and returns the number of probes seen.
    pub fn finish(&self) -> u64 {
        let mut ledger = self.inner.lock();
        ledger.finished = true;
        ledger.probes.len() as u64
    }

    pub fn probe(&self, seq: u64) -> Option<ProbeTiming> {
        self.inner.lock().probes.get(&seq).copied()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let ledger = self.inner.lock();
        SessionSnapshot {
            direction: ledger.direction,
            packets_received: ledger.probes.len() as u64,
            finished: ledger.finished,
        }
    }
}

/// Machine-readable record of one client test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub direction: Direction,
    pub success: bool,
    #[serde(flatten)]
    pub result: TransferResult,
}

impl TestReport {
    pub fn new(protocol: Protocol, direction: Direction, result: TransferResult) -> Self {
        Self {
            timestamp: Utc::now(),
            protocol,
            direction,
            success: !result.is_failed(),
            result,
        }
    }

    /// Pretty-printed JSON form, as written by `--json`.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Formats a byte count for display using binary units.
///
/// # Examples
///
/// ```
/// use netspeed::measurements::format_size;
///
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1536), "1.50 KB");
/// assert_eq!(format_size(10 * 1024 * 1024), "10.00 MB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes < KIB {
        format!("{} B", bytes)
    } else if bytes < MIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else if bytes < GIB {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GIB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_speed_mbps() {
        assert!(approx_eq(speed_mbps(10 * 1024 * 1024, 2.0), 40.0));
        assert_eq!(speed_mbps(100, 0.0), 0.0);
        assert_eq!(speed_mbps(100, -1.0), 0.0);
    }

    #[test]
    fn test_sample_stats() {
        assert!(SampleStats::from_samples(&[]).is_none());

        let single = SampleStats::from_samples(&[4.0]).unwrap();
        assert_eq!(single.mean, 4.0);
        assert_eq!(single.min, 4.0);
        assert_eq!(single.max, 4.0);
        assert_eq!(single.std_dev, 0.0);

        let pair = SampleStats::from_samples(&[1.0, 3.0]).unwrap();
        assert!(approx_eq(pair.mean, 2.0));
        assert!(approx_eq(pair.std_dev, 2.0 / 2f64.sqrt()));

        let set = SampleStats::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!(approx_eq(set.mean, 5.0));
        assert_eq!(set.min, 2.0);
        assert_eq!(set.max, 9.0);
        // Sample variance 32 / 7
        assert!(approx_eq(set.std_dev, (32.0f64 / 7.0).sqrt()));
    }

    #[test]
    fn test_failed_result() {
        let failed = TransferResult::failed();
        assert!(failed.is_failed());
        assert!(failed.stats.is_none());
        assert!(!TransferResult::new(10, 0.5).is_failed());
    }

    #[test]
    fn test_ledger_loss_and_rtt() {
        let base = Instant::now();
        let mut ledger = PacketLedger::new();
        for seq in 0..4 {
            ledger.record_sent(seq, base + Duration::from_millis(seq * 10));
        }
        assert!(ledger.record_ack(0, 1.0, base + Duration::from_millis(5)));
        assert!(ledger.record_ack(2, 1.0, base + Duration::from_millis(27)));
        assert!(!ledger.record_ack(9, 1.0, base + Duration::from_millis(30)));

        let rtts = ledger.rtt_samples_ms();
        assert_eq!(rtts.len(), 2);
        assert!(approx_eq(rtts[0], 5.0));
        assert!(approx_eq(rtts[1], 7.0));

        let stats = ledger.summarize();
        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.packets_received, 2);
        assert!(approx_eq(stats.packet_loss, 50.0));
        assert!(approx_eq(stats.min_rtt_ms, 5.0));
        assert!(approx_eq(stats.max_rtt_ms, 7.0));
        assert!(approx_eq(stats.avg_rtt_ms, 6.0));
        assert!(approx_eq(stats.jitter_ms, 2.0 / 2f64.sqrt()));
    }

    #[test]
    fn test_ledger_duplicate_ack_counted_once() {
        let base = Instant::now();
        let mut ledger = PacketLedger::new();
        ledger.record_sent(0, base);
        ledger.record_ack(0, 1.0, base + Duration::from_millis(1));
        ledger.record_ack(0, 2.0, base + Duration::from_millis(2));

        assert_eq!(ledger.packets_received(), 1);
        assert_eq!(ledger.ack(0).map(|a| a.server_time), Some(2.0));
    }

    #[test]
    fn test_ledger_single_sample_has_no_jitter() {
        let base = Instant::now();
        let mut ledger = PacketLedger::new();
        ledger.record_sent(0, base);
        ledger.record_sent(1, base);
        ledger.record_ack(1, 1.0, base + Duration::from_millis(3));

        let stats = ledger.summarize();
        assert_eq!(stats.jitter_ms, 0.0);
        assert!(approx_eq(stats.avg_rtt_ms, 3.0));
    }

    #[test]
    fn test_empty_ledger() {
        let stats = PacketLedger::new().summarize();
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.packet_loss, 0.0);
        assert_eq!(stats.avg_rtt_ms, 0.0);
        assert_eq!(stats.jitter_ms, 0.0);
    }

    #[test]
    fn test_session_collector_resets() {
        let collector = SessionCollector::new();
        collector.reset(Direction::Upload);
        collector.record_probe(0, 1.0, 1.1);
        collector.record_probe(1, 2.0, 2.1);
        assert_eq!(collector.finish(), 2);
        assert_eq!(
            collector.probe(1),
            Some(ProbeTiming {
                client_time: 2.0,
                server_time: 2.1
            })
        );

        collector.reset(Direction::Download);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.direction, Some(Direction::Download));
        assert_eq!(snapshot.packets_received, 0);
        assert!(!snapshot.finished);
        assert!(collector.probe(1).is_none());
    }

    #[test]
    fn test_report_json() {
        let result = TransferResult::new(1024 * 1024, 1.0);
        let report = TestReport::new(Protocol::Tcp, Direction::Upload, result);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["protocol"], "tcp");
        assert_eq!(json["direction"], "upload");
        assert_eq!(json["success"], true);
        assert_eq!(json["bytes"], 1048576);
        assert_eq!(json["speed_mbps"], 8.0);
        assert!(json["stats"].is_null());

        let text = report.to_json().unwrap();
        assert!(text.contains("\"direction\": \"upload\""));
        assert!(text.contains('\n'));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
