//! Wire formats shared by the client and server roles.
//!
//! Stream tests open with a fixed-size command frame naming the direction and
//! finish with a text `STATS:` frame carrying the server's measurement.
//! Datagram tests exchange small colon-delimited text messages, one per
//! datagram:
//!
//! ```text
//! client                          server
//!   START:<upload|download>  -->
//!                            <--  READY
//!   SEQ:<n>:<send_time>      -->
//!                            <--  ACK:<n>:<server_time>
//!   ...
//!   END                      -->
//!                            <--  RESULTS:<count>
//! ```
//!
//! Timestamps are seconds since the UNIX epoch written as decimal floats.

use crate::config::Direction;
use crate::{Error, Result};
use std::fmt;

/// Length of the stream command frame.
pub const COMMAND_FRAME_LEN: usize = 16;

/// Prefix of the stream statistics frame.
pub const STATS_PREFIX: &[u8] = b"STATS:";

/// Upper bound on an encoded `STATS:` frame.
///
/// `STATS:` + 20 digits + `:` + a float with up to 17 significant digits
/// and a fractional part stays well below this.
pub const MAX_STATS_FRAME_LEN: usize = 96;

/// Encodes the space-padded command frame a client opens a stream test with.
///
/// # Examples
///
/// ```
/// use netspeed::protocol::{encode_command, COMMAND_FRAME_LEN};
/// use netspeed::Direction;
///
/// let frame = encode_command(Direction::Upload);
/// assert_eq!(frame.len(), COMMAND_FRAME_LEN);
/// assert_eq!(&frame[..6], b"upload");
/// assert!(frame[6..].iter().all(|&b| b == b' '));
/// ```
pub fn encode_command(direction: Direction) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [b' '; COMMAND_FRAME_LEN];
    let token = direction.as_str().as_bytes();
    frame[..token.len()].copy_from_slice(token);
    frame
}

/// A decoded stream command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A recognised test request
    Test(Direction),
    /// Any other token; the server closes the connection without replying
    Unknown(String),
}

/// Decodes a command frame, trimming padding whitespace and NUL bytes.
pub fn decode_command(frame: &[u8]) -> Command {
    let text = String::from_utf8_lossy(frame);
    let token = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    match token.parse::<Direction>() {
        Ok(direction) => Command::Test(direction),
        Err(_) => Command::Unknown(token.to_string()),
    }
}

/// Server-side measurement of a stream transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsFrame {
    /// Payload bytes the server moved
    pub bytes: u64,
    /// Seconds the server spent moving them
    pub duration: f64,
}

impl StatsFrame {
    pub fn new(bytes: u64, duration: f64) -> Self {
        Self { bytes, duration }
    }

    /// Encodes the frame as `STATS:<bytes>:<duration>`.
    pub fn encode(&self) -> Vec<u8> {
        format!("STATS:{}:{}", self.bytes, self.duration).into_bytes()
    }

    /// Parses a complete `STATS:` frame.
    ///
    /// Trailing whitespace is tolerated. Anything else that does not match
    /// the grammar yields [`Error::ProtocolParse`].
    ///
    /// # Examples
    ///
    /// ```
    /// use netspeed::protocol::StatsFrame;
    ///
    /// let frame = StatsFrame::parse(b"STATS:1048576:0.25").unwrap();
    /// assert_eq!(frame.bytes, 1_048_576);
    /// assert_eq!(frame.duration, 0.25);
    ///
    /// assert!(StatsFrame::parse(b"STATS:lots:0.25").is_err());
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::ProtocolParse("STATS frame is not UTF-8".to_string()))?;
        let body = text
            .trim_end()
            .strip_prefix("STATS:")
            .ok_or_else(|| Error::ProtocolParse(format!("expected STATS frame, got '{}'", text)))?;

        let (bytes, duration) = body
            .split_once(':')
            .ok_or_else(|| Error::ProtocolParse(format!("malformed STATS frame '{}'", text)))?;
        let bytes = bytes
            .parse::<u64>()
            .map_err(|_| Error::ProtocolParse(format!("bad byte count '{}'", bytes)))?;
        let duration = parse_seconds(duration)?;

        Ok(Self { bytes, duration })
    }
}

/// Finds the `STATS:` frame appended to a download payload.
///
/// The stream carries no message boundaries, so the client feeds every chunk
/// through the scanner and, once the server closes the stream, looks for the
/// last `STATS:` occurrence in the retained tail. Only the final
/// [`MAX_STATS_FRAME_LEN`] bytes are kept.
#[derive(Debug, Default)]
pub struct TrailerScanner {
    tail: Vec<u8>,
}

impl TrailerScanner {
    pub fn new() -> Self {
        Self {
            tail: Vec::with_capacity(MAX_STATS_FRAME_LEN * 2),
        }
    }

    /// Records a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= MAX_STATS_FRAME_LEN {
            self.tail.clear();
            self.tail
                .extend_from_slice(&chunk[chunk.len() - MAX_STATS_FRAME_LEN..]);
            return;
        }
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > MAX_STATS_FRAME_LEN {
            let excess = self.tail.len() - MAX_STATS_FRAME_LEN;
            self.tail.drain(..excess);
        }
    }

    /// Returns the trailing frame and its encoded length, if the stream
    /// ended with one.
    pub fn finish(&self) -> Option<(StatsFrame, usize)> {
        let start = self
            .tail
            .windows(STATS_PREFIX.len())
            .rposition(|window| window == STATS_PREFIX)?;
        let candidate = &self.tail[start..];
        StatsFrame::parse(candidate)
            .ok()
            .map(|frame| (frame, candidate.len()))
    }
}

/// One datagram of the UDP measurement session.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Opens a session and resets the server's ledger
    Start(Direction),
    /// Session accepted
    Ready,
    /// Probe carrying the client's send time
    Seq { seq: u64, sent_at: f64 },
    /// Reply to a probe carrying the server's time
    Ack { seq: u64, server_time: f64 },
    /// Session close
    End,
    /// Number of probes the server recorded in the session
    Results { count: u64 },
}

impl Message {
    /// Encodes the message as the bytes of one datagram.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parses one datagram.
    ///
    /// # Examples
    ///
    /// ```
    /// use netspeed::protocol::Message;
    ///
    /// let msg = Message::parse(b"ACK:7:1700000000.5").unwrap();
    /// assert_eq!(msg, Message::Ack { seq: 7, server_time: 1700000000.5 });
    /// assert!(Message::parse(b"ACK:seven:1.0").is_err());
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::ProtocolParse("datagram is not UTF-8".to_string()))?
            .trim();
        let mut parts = text.split(':');
        let kind = parts.next().unwrap_or_default();

        let msg = match kind {
            "START" => {
                let token = next_field(&mut parts, text)?;
                let direction = token
                    .parse::<Direction>()
                    .map_err(|_| Error::ProtocolParse(format!("unknown test type '{}'", token)))?;
                Message::Start(direction)
            }
            "READY" => Message::Ready,
            "SEQ" => Message::Seq {
                seq: parse_seq(next_field(&mut parts, text)?)?,
                sent_at: parse_seconds(next_field(&mut parts, text)?)?,
            },
            "ACK" => Message::Ack {
                seq: parse_seq(next_field(&mut parts, text)?)?,
                server_time: parse_seconds(next_field(&mut parts, text)?)?,
            },
            "END" => Message::End,
            "RESULTS" => Message::Results {
                count: parse_seq(next_field(&mut parts, text)?)?,
            },
            _ => {
                return Err(Error::ProtocolParse(format!(
                    "unknown message '{}'",
                    text
                )))
            }
        };

        if parts.next().is_some() {
            return Err(Error::ProtocolParse(format!(
                "unexpected trailing fields in '{}'",
                text
            )));
        }
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Start(direction) => write!(f, "START:{}", direction),
            Message::Ready => f.write_str("READY"),
            Message::Seq { seq, sent_at } => write!(f, "SEQ:{}:{}", seq, sent_at),
            Message::Ack { seq, server_time } => write!(f, "ACK:{}:{}", seq, server_time),
            Message::End => f.write_str("END"),
            Message::Results { count } => write!(f, "RESULTS:{}", count),
        }
    }
}

fn next_field<'a>(parts: &mut impl Iterator<Item = &'a str>, text: &str) -> Result<&'a str> {
    parts
        .next()
        .ok_or_else(|| Error::ProtocolParse(format!("missing field in '{}'", text)))
}

fn parse_seq(field: &str) -> Result<u64> {
    field
        .parse::<u64>()
        .map_err(|_| Error::ProtocolParse(format!("bad integer '{}'", field)))
}

fn parse_seconds(field: &str) -> Result<f64> {
    match field.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(Error::ProtocolParse(format!("bad time value '{}'", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_command() {
        assert_eq!(
            decode_command(&encode_command(Direction::Upload)),
            Command::Test(Direction::Upload)
        );
        assert_eq!(
            decode_command(b"download\0\0\0\0\0\0\0\0"),
            Command::Test(Direction::Download)
        );
        assert_eq!(
            decode_command(b"  upload  \n     "),
            Command::Test(Direction::Upload)
        );
        assert_eq!(
            decode_command(b"sideways        "),
            Command::Unknown("sideways".to_string())
        );
    }

    #[test]
    fn test_stats_frame_encoding() {
        let frame = StatsFrame::new(1_048_576, 0.125);
        assert_eq!(frame.encode(), b"STATS:1048576:0.125".to_vec());
    }

    #[test]
    fn test_stats_frame_rejects_malformed() {
        assert!(matches!(
            StatsFrame::parse(b"STATS:10"),
            Err(Error::ProtocolParse(_))
        ));
        assert!(matches!(
            StatsFrame::parse(b"STATS:10:abc"),
            Err(Error::ProtocolParse(_))
        ));
        assert!(matches!(
            StatsFrame::parse(b"STATS:-1:0.5"),
            Err(Error::ProtocolParse(_))
        ));
        assert!(matches!(
            StatsFrame::parse(b"STATS:10:NaN"),
            Err(Error::ProtocolParse(_))
        ));
        assert!(matches!(
            StatsFrame::parse(b"HELLO"),
            Err(Error::ProtocolParse(_))
        ));
        assert!(matches!(
            StatsFrame::parse(&[0xff, 0xfe]),
            Err(Error::ProtocolParse(_))
        ));
    }

    #[test]
    fn test_trailer_scanner_finds_frame_split_across_chunks() {
        let mut scanner = TrailerScanner::new();
        scanner.push(&[0xAA; 8192]);
        scanner.push(&[0x55; 100]);
        scanner.push(b"STA");
        scanner.push(b"TS:4096:0.0");
        scanner.push(b"5");

        let (frame, len) = scanner.finish().expect("trailer present");
        assert_eq!(frame.bytes, 4096);
        assert_eq!(frame.duration, 0.05);
        assert_eq!(len, "STATS:4096:0.05".len());
    }

    #[test]
    fn test_trailer_scanner_frame_glued_to_payload() {
        let mut payload = vec![7u8; 300];
        payload.extend_from_slice(b"STATS:300:1.5");

        let mut scanner = TrailerScanner::new();
        scanner.push(&payload);
        let (frame, len) = scanner.finish().unwrap();
        assert_eq!(frame, StatsFrame::new(300, 1.5));
        assert_eq!(payload.len() - len, 300);
    }

    #[test]
    fn test_trailer_scanner_without_frame() {
        let mut scanner = TrailerScanner::new();
        scanner.push(&[1u8; 4096]);
        assert!(scanner.finish().is_none());

        // A prefix inside payload that is not followed by a valid frame
        let mut scanner = TrailerScanner::new();
        scanner.push(b"xxSTATS:yy\x01\x02\x03");
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn test_message_display() {
        assert_eq!(Message::Start(Direction::Upload).to_string(), "START:upload");
        assert_eq!(Message::Ready.to_string(), "READY");
        assert_eq!(
            Message::Seq { seq: 3, sent_at: 12.5 }.to_string(),
            "SEQ:3:12.5"
        );
        assert_eq!(Message::End.to_string(), "END");
        assert_eq!(Message::Results { count: 42 }.to_string(), "RESULTS:42");
    }

    #[test]
    fn test_message_parse() {
        assert_eq!(
            Message::parse(b"START:download").unwrap(),
            Message::Start(Direction::Download)
        );
        assert_eq!(Message::parse(b"READY").unwrap(), Message::Ready);
        assert_eq!(
            Message::parse(b"SEQ:999:1700000000.123456").unwrap(),
            Message::Seq {
                seq: 999,
                sent_at: 1700000000.123456
            }
        );
        assert_eq!(Message::parse(b"END").unwrap(), Message::End);
        assert_eq!(
            Message::parse(b"RESULTS:1000").unwrap(),
            Message::Results { count: 1000 }
        );
    }

    #[test]
    fn test_message_parse_errors() {
        for bad in [
            &b"START:sideways"[..],
            b"SEQ:1",
            b"SEQ:x:1.0",
            b"ACK:1:later",
            b"READY:now",
            b"PING",
            b"",
            &[0xc3, 0x28],
        ] {
            assert!(
                matches!(Message::parse(bad), Err(Error::ProtocolParse(_))),
                "expected parse error for {:?}",
                bad
            );
        }
    }
}
