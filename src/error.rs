//! Error type shared by the replay library.
//!
//! Corrupt-input and configuration variants are fatal for a run. I/O errors
//! are wrapped so callers can decide whether the failing operation is
//! transient (a single send) or fatal (binding a socket at startup).
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    /// A length prefix declares more bytes than remain in the file.
    #[error("frame at offset {offset} declares {declared} bytes but only {remaining} remain")]
    FrameOverrun {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    /// The frame is too short to hold the fixed-offset timestamp.
    #[error("frame of {len} bytes is too short to carry a timestamp")]
    FrameTooShort { len: usize },

    /// The frame can never fit into an empty packet.
    #[error("frame at offset {offset} is {len} bytes, larger than the {capacity} byte message block")]
    FrameTooLarge {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("timestamp {nanos}ns is not within a 24 hour day")]
    TimestampOutOfRange { nanos: u64 },

    #[error("session id {session:?} has length {len}, expected {expected}")]
    SessionLength {
        session: String,
        len: usize,
        expected: usize,
    },

    #[error("sequence index capacity {0} is not a non-zero power of two")]
    IndexCapacity(usize),

    #[error("downstream address {0} is not an IPv4 multicast group")]
    NotMulticast(SocketAddr),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReplayError {
    /// True for errors that mean the replay file itself cannot be trusted.
    pub fn is_corrupt_input(&self) -> bool {
        matches!(
            self,
            ReplayError::FrameOverrun { .. }
                | ReplayError::FrameTooShort { .. }
                | ReplayError::FrameTooLarge { .. }
                | ReplayError::TimestampOutOfRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
