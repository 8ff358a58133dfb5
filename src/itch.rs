//! TotalView-ITCH replay file framing.
//!
//! A replay file is a run of frames laid out as
//! `[len:u16 BE][len bytes of ITCH message]`. Every ITCH message starts with
//! `type(1) stock_locate(2) tracking_number(2) timestamp(6)`, so the timestamp
//! sits at a fixed offset from the start of the frame.
//!
//! Reading past the end of the file is never truncated silently: a length
//! prefix that overruns the file is reported as [`ReplayError::FrameOverrun`].
use crate::error::{ReplayError, Result};
use std::fmt;
use std::time::Duration;
use time::macros::format_description;

/// Size of the big-endian length prefix in front of each message.
pub const LEN_PREFIX_SIZE: usize = 2;
pub const TIMESTAMP_SIZE: usize = 6;
/// Offset of the timestamp from the start of a frame (prefix included).
pub const TIMESTAMP_OFFSET: usize = LEN_PREFIX_SIZE + 5;

const NANOS_PER_SEC: u64 = 1_000_000_000;
const NANOS_PER_DAY: u64 = 24 * 60 * 60 * NANOS_PER_SEC;

/// A view of one length-prefixed frame inside the replay file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFrame<'a> {
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> MessageFrame<'a> {
    /// File offset of the length prefix.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length including the prefix.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the first byte after this frame.
    pub fn end(&self) -> usize {
        self.offset + self.bytes.len()
    }

    /// Prefix and message, exactly as stored in the file.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The ITCH message without its length prefix.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[LEN_PREFIX_SIZE..]
    }

    /// ITCH message type tag, if the message is non-empty.
    pub fn message_type(&self) -> Option<u8> {
        self.payload().first().copied()
    }
}

/// Reads the frame starting at `cursor`.
///
/// Returns `Ok(None)` once fewer than two bytes remain.
pub fn next_frame(file: &[u8], cursor: usize) -> Result<Option<MessageFrame<'_>>> {
    let remaining = file.len().saturating_sub(cursor);
    if remaining < LEN_PREFIX_SIZE {
        return Ok(None);
    }
    let declared = u16::from_be_bytes([file[cursor], file[cursor + 1]]) as usize + LEN_PREFIX_SIZE;
    if declared > remaining {
        return Err(ReplayError::FrameOverrun {
            offset: cursor,
            declared,
            remaining,
        });
    }
    Ok(Some(MessageFrame {
        offset: cursor,
        bytes: &file[cursor..cursor + declared],
    }))
}

/// Decodes the 6-byte big-endian timestamp embedded in `frame`.
pub fn extract_timestamp(frame: &MessageFrame<'_>) -> Result<Timestamp> {
    let bytes = frame.as_bytes();
    if bytes.len() < TIMESTAMP_OFFSET + TIMESTAMP_SIZE {
        return Err(ReplayError::FrameTooShort { len: bytes.len() });
    }
    let nanos = bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_SIZE]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Timestamp::from_nanos(nanos)
}

/// Iterates the frames of a byte range from `cursor` to its end.
///
/// Stops after the first error.
pub fn frames(file: &[u8], cursor: usize) -> Frames<'_> {
    Frames {
        file,
        cursor,
        failed: false,
    }
}

pub struct Frames<'a> {
    file: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<MessageFrame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match next_frame(self.file, self.cursor) {
            Ok(Some(frame)) => {
                self.cursor = frame.end();
                Some(Ok(frame))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Nanoseconds since midnight, always below 24 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIDNIGHT: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Result<Self> {
        if nanos >= NANOS_PER_DAY {
            return Err(ReplayError::TimestampOutOfRange { nanos });
        }
        Ok(Timestamp(nanos))
    }

    pub fn from_duration(d: Duration) -> Result<Self> {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Self::from_nanos(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Time elapsed since `earlier`, zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / NANOS_PER_SEC;
        let formatted = time::Time::from_hms_nano(
            (secs / 3600) as u8,
            ((secs / 60) % 60) as u8,
            (secs % 60) as u8,
            (self.0 % NANOS_PER_SEC) as u32,
        )
        .ok()
        .and_then(|t| {
            t.format(format_description!("[hour]:[minute]:[second].[subsecond digits:9]"))
                .ok()
        });
        match formatted {
            Some(s) => f.write_str(&s),
            None => write!(f, "{}ns", self.0),
        }
    }
}

/// Nasdaq market phase a replay can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MarketPhase {
    /// Start of the capture (pre-market).
    #[default]
    Pre,
    /// Regular session open, 09:30.
    Open,
    /// Regular session close, 16:00.
    Close,
}

impl MarketPhase {
    /// Messages stamped before this time are indexed but not sent live.
    pub fn start_timestamp(self) -> Timestamp {
        let hours_minutes = |h: u64, m: u64| Timestamp((h * 3600 + m * 60) * NANOS_PER_SEC);
        match self {
            MarketPhase::Pre => Timestamp::MIDNIGHT,
            MarketPhase::Open => hours_minutes(9, 30),
            MarketPhase::Close => hours_minutes(16, 0),
        }
    }
}
