//! MoldUDP64 replay server for NASDAQ TotalView-ITCH captures.
//!
//! This crate provides the pieces used by the `mold_replay` server binary and
//! the `listener` tool:
//!
//! - `itch`: length-prefixed frame reader and timestamp extraction
//! - `mold`: MoldUDP64 header layout and the bounded packet assembler
//! - `pacer`: maps capture timestamps onto wall-clock send times
//! - `index`: lock-free sequence number to file offset ring shared between
//!   the feed and the recovery workers
//! - `feed`: the multicast downstream driver
//! - `recovery`: the unicast retransmission worker pool
//!
//! The replay file is shared read-only between all threads as a [`bytes::Bytes`].
pub mod config;
pub mod error;
pub mod feed;
pub mod index;
pub mod itch;
pub mod mold;
pub mod pacer;
pub mod recovery;

pub use config::{DownstreamConfig, EndOfSession, ReplayConfig};
pub use error::{ReplayError, Result};
pub use feed::{FeedDriver, FeedSummary, MulticastSink, PacketSink};
pub use index::SequenceIndex;
pub use itch::{MarketPhase, MessageFrame, Timestamp};
pub use mold::{DownstreamHeader, PacketAssembler, RetransmissionRequest, Session};
pub use pacer::ReplayPacer;
pub use recovery::RetransmissionServer;
