use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use dotenvy::dotenv;
use memmap2::Mmap;
use mold_replay::config::{self, DownstreamConfig, EndOfSession, ReplayConfig};
use mold_replay::{FeedDriver, MarketPhase, MulticastSink, RetransmissionServer, SequenceIndex, Session};
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Replay a TotalView-ITCH capture as a MoldUDP64 feed with retransmission")]
struct Args {
    /// MoldUDP64 session id (exactly 10 characters)
    #[arg(env = "MOLD_SESSION")]
    session: String,

    /// TotalView-ITCH replay file (2-byte length prefixed messages)
    #[arg(env = "ITCH_REPLAY_FILE")]
    replay_file: PathBuf,

    /// Downstream multicast group
    #[arg(long = "group", env = "DOWNSTREAM_GROUP", default_value_t = *config::DEFAULT_GROUP.ip())]
    group: Ipv4Addr,

    /// Downstream port
    #[arg(long, env = "DOWNSTREAM_PORT", default_value_t = config::DEFAULT_GROUP.port(),
          value_parser = clap::value_parser!(u16).range(1024..))]
    downstream_port: u16,

    /// Multicast TTL
    #[arg(long = "ttl", env = "MCAST_TTL", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(0..=255))]
    ttl: u32,

    /// Loop multicast packets back to local listeners
    #[arg(long, env = "MCAST_LOOPBACK", default_value_t = false)]
    loopback: bool,

    /// Replay speed multiplier (2.0 = twice as fast as captured)
    #[arg(long = "speed", alias = "replay-speed", env = "REPLAY_SPEED", default_value_t = 1.0)]
    speed: f64,

    /// Market phase to start live transmission from
    #[arg(long = "start-phase", alias = "start", env = "START_PHASE", value_enum, default_value_t = MarketPhase::Pre)]
    start_phase: MarketPhase,

    /// Address the retransmission service binds to
    #[arg(long, env = "RETRANS_ADDRESS", default_value_t = IpAddr::V4(*config::DEFAULT_RECOVERY.ip()))]
    retrans_address: IpAddr,

    /// Retransmission port
    #[arg(long, env = "RETRANS_PORT", default_value_t = config::DEFAULT_RECOVERY.port(),
          value_parser = clap::value_parser!(u16).range(1025..))]
    retrans_port: u16,

    /// Messages kept for retransmission (power of two)
    #[arg(long, env = "RETRANS_BUFFER_SIZE", default_value_t = config::DEFAULT_INDEX_CAPACITY)]
    retrans_buffer_size: usize,

    /// Retransmission worker threads (defaults to available cores)
    #[arg(long = "threads", alias = "retrans-threads", env = "RETRANS_THREADS")]
    threads: Option<usize>,

    /// Network MTU used to size packets
    #[arg(long, env = "MTU", default_value_t = mold_replay::mold::MTU_SIZE)]
    mtu: usize,

    /// Milliseconds between end-of-session announcements
    #[arg(long, env = "EOS_INTERVAL_MS", default_value_t = 1000)]
    eos_interval_ms: u64,

    /// Seconds to keep announcing end of session
    #[arg(long, env = "EOS_DURATION_SECS", default_value_t = 30)]
    eos_duration_secs: u64,
}

impl Args {
    fn into_config(self) -> Result<(ReplayConfig, PathBuf)> {
        let session: Session = self.session.parse()?;
        let mut cfg = ReplayConfig::new(session);
        cfg.downstream = DownstreamConfig {
            group: SocketAddrV4::new(self.group, self.downstream_port),
            ttl: self.ttl,
            loopback: self.loopback,
        };
        cfg.replay_speed = self.speed;
        cfg.start_phase = self.start_phase;
        cfg.recovery_addr = SocketAddr::new(self.retrans_address, self.retrans_port);
        cfg.index_capacity = self.retrans_buffer_size;
        if let Some(threads) = self.threads {
            cfg.recovery_workers = threads;
        }
        cfg.mtu = self.mtu;
        cfg.end_of_session = EndOfSession {
            interval: Duration::from_millis(self.eos_interval_ms),
            duration: Duration::from_secs(self.eos_duration_secs),
        };
        cfg.validate()?;
        Ok((cfg, self.replay_file))
    }
}

fn load_replay_file(path: &Path) -> Result<Bytes> {
    let file = File::open(path).with_context(|| format!("open replay file {:?}", path))?;
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("map replay file {:?}", path))?;
    Ok(Bytes::from_owner(mmap))
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, path) = Args::parse().into_config()?;
    let file = load_replay_file(&path)?;
    info!(
        file = ?path,
        bytes = file.len(),
        session = %cfg.session,
        group = %cfg.downstream.group,
        speed = cfg.replay_speed,
        start = %cfg.start_after(),
        "replay loaded"
    );

    let index = Arc::new(SequenceIndex::new(cfg.index_capacity)?);
    let recovery = RetransmissionServer::start(&cfg, file.clone(), Arc::clone(&index))
        .context("start retransmission service")?;
    let sink = MulticastSink::open(&cfg.downstream).context("open downstream socket")?;
    info!(dest = %sink.destination(), ttl = cfg.downstream.ttl, "downstream socket open");

    // The feed runs on this thread; recovery stops once it is done.
    let outcome = FeedDriver::new(&cfg, file, index, sink).and_then(|mut feed| feed.run());
    recovery.shutdown();

    match outcome {
        Ok(summary) => {
            info!(
                messages = summary.messages,
                packets = summary.packets_sent,
                final_seq = summary.next_sequence,
                "replay complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "replay aborted");
            Err(e).context("downstream feed")
        }
    }
}
