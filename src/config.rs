//! Run configuration, validated before any socket is opened.
use crate::error::{ReplayError, Result};
use crate::itch::{MarketPhase, Timestamp};
use crate::mold::{self, Session};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

pub const DEFAULT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 1), 3400);
pub const DEFAULT_RECOVERY: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3500);
pub const DEFAULT_INDEX_CAPACITY: usize = 1 << 22;

/// Where and how the live feed is multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownstreamConfig {
    pub group: SocketAddrV4,
    pub ttl: u32,
    pub loopback: bool,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            ttl: 1,
            loopback: false,
        }
    }
}

/// Repetition of the end-of-session announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfSession {
    pub interval: Duration,
    pub duration: Duration,
}

impl Default for EndOfSession {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            duration: Duration::from_secs(30),
        }
    }
}

impl EndOfSession {
    /// Number of announcements sent; always at least one.
    pub fn repeats(&self) -> u64 {
        if self.interval.is_zero() {
            return 1;
        }
        let n = self.duration.as_nanos() / self.interval.as_nanos();
        u64::try_from(n).unwrap_or(u64::MAX).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub session: Session,
    pub downstream: DownstreamConfig,
    /// Multiplier applied to historical time; 2.0 replays twice as fast.
    pub replay_speed: f64,
    pub start_phase: MarketPhase,
    pub recovery_addr: SocketAddr,
    /// Sequence index slots; a power of two.
    pub index_capacity: usize,
    pub recovery_workers: usize,
    pub mtu: usize,
    pub end_of_session: EndOfSession,
}

impl ReplayConfig {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            downstream: DownstreamConfig::default(),
            replay_speed: 1.0,
            start_phase: MarketPhase::Pre,
            recovery_addr: SocketAddr::V4(DEFAULT_RECOVERY),
            index_capacity: DEFAULT_INDEX_CAPACITY,
            recovery_workers: default_workers(),
            mtu: mold::MTU_SIZE,
            end_of_session: EndOfSession::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.index_capacity.is_power_of_two() {
            return Err(ReplayError::IndexCapacity(self.index_capacity));
        }
        if !self.downstream.group.ip().is_multicast() {
            return Err(ReplayError::NotMulticast(SocketAddr::V4(self.downstream.group)));
        }
        if self.downstream.ttl > 255 {
            return Err(ReplayError::Config(format!(
                "multicast ttl {} exceeds 255",
                self.downstream.ttl
            )));
        }
        if !(self.replay_speed.is_finite() && self.replay_speed > 0.0) {
            return Err(ReplayError::Config(format!(
                "replay speed {} must be a positive number",
                self.replay_speed
            )));
        }
        if self.recovery_workers == 0 {
            return Err(ReplayError::Config("at least one recovery worker is required".into()));
        }
        mold::max_payload_for_mtu(self.mtu)?;
        Ok(())
    }

    /// Largest packet, header included, for the configured MTU.
    pub fn max_payload(&self) -> Result<usize> {
        mold::max_payload_for_mtu(self.mtu)
    }

    pub fn start_after(&self) -> Timestamp {
        self.start_phase.start_timestamp()
    }
}

/// One recovery worker per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
