use anyhow::{Context, Result, bail};
use clap::Parser;
use mold_replay::itch::{self, Timestamp};
use mold_replay::mold::{DownstreamHeader, HEADER_SIZE, Session};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Follow a MoldUDP64 feed, recovering gaps from the retransmission port")]
struct Args {
    /// Multicast group to join
    #[arg(long, default_value_t = Ipv4Addr::new(239, 0, 0, 1))]
    group: Ipv4Addr,

    /// Downstream port
    #[arg(long, default_value_t = 3400)]
    port: u16,

    /// Local interface used to join the group
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Retransmission server address
    #[arg(long, default_value = "127.0.0.1:3500")]
    retrans: SocketAddr,

    /// Milliseconds to wait for a retransmission response
    #[arg(long, default_value_t = 500)]
    retrans_timeout_ms: u64,

    /// Largest gap requested in one retransmission request
    #[arg(long, default_value_t = 512)]
    max_request: u16,

    /// Print every message's type and timestamp
    #[arg(long, default_value_t = false)]
    print_messages: bool,
}

#[derive(Debug, Default)]
struct Stats {
    packets: u64,
    messages: u64,
    gaps: u64,
    requested: u64,
    recovered: u64,
}

fn join_group(args: &Args) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, args.port));
    socket.bind(&bind.into()).with_context(|| format!("bind {bind}"))?;
    socket
        .join_multicast_v4(&args.group, &args.interface)
        .with_context(|| format!("join {}", args.group))?;
    Ok(socket.into())
}

fn print_messages(block: &[u8], first_seq: u64) -> Result<u64> {
    let mut count = 0u64;
    for frame in itch::frames(block, 0) {
        let frame = frame?;
        let ts = itch::extract_timestamp(&frame)
            .map(|t| t.to_string())
            .unwrap_or_else(|_| "-".to_string());
        let kind = frame.message_type().map(char::from).unwrap_or('?');
        println!("seq={} type={} ts={} len={}", first_seq + count, kind, ts, frame.payload().len());
        count += 1;
    }
    Ok(count)
}

/// Requests `[from, from + count)` and waits for the responses.
fn recover(args: &Args, socket: &UdpSocket, session: Session, from: u64, count: u16) -> Result<u64> {
    let request = DownstreamHeader::new(session, from, count).encode();
    socket.send_to(&request, args.retrans)?;
    let mut buf = [0u8; 65_536];
    let mut recovered = 0u64;
    while recovered < u64::from(count) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => return Err(e.into()),
        };
        let Some(header) = DownstreamHeader::decode(&buf[..len]) else {
            continue;
        };
        if header.sequence_number != from + recovered {
            warn!(expected = from + recovered, got = header.sequence_number, "out of order retransmission");
        }
        if args.print_messages {
            print_messages(&buf[HEADER_SIZE..len], header.sequence_number)?;
        }
        recovered += u64::from(header.message_count);
    }
    Ok(recovered)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    if args.max_request == 0 {
        bail!("--max-request must be at least 1");
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)).context("install Ctrl+C handler")?;
    }

    let feed = join_group(&args)?;
    // Wake periodically so Ctrl+C is noticed on a silent feed
    feed.set_read_timeout(Some(Duration::from_millis(250)))?;
    let recovery = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    recovery.set_read_timeout(Some(Duration::from_millis(args.retrans_timeout_ms.max(1))))?;
    info!(group = %args.group, port = args.port, "listening");

    let mut stats = Stats::default();
    let mut expected: Option<u64> = None;
    let mut first_ts: Option<Timestamp> = None;
    let mut buf = [0u8; 65_536];

    while !stop.load(Ordering::Relaxed) {
        let len = match feed.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => return Err(e).context("receive from feed"),
        };
        let Some(header) = DownstreamHeader::decode(&buf[..len]) else {
            warn!(len, "runt datagram ignored");
            continue;
        };
        if header.is_end_of_session() {
            info!(session = %header.session, seq = header.sequence_number, "end of session");
            if let Some(next) = expected.filter(|next| *next < header.sequence_number) {
                stats.gaps += 1;
                warn!(from = next, to = header.sequence_number, "messages missing at end of session");
            }
            break;
        }

        let next = expected.unwrap_or(header.sequence_number);
        if header.sequence_number > next {
            stats.gaps += 1;
            let mut from = next;
            while from < header.sequence_number {
                let count = (header.sequence_number - from).min(u64::from(args.max_request)) as u16;
                stats.requested += u64::from(count);
                stats.recovered += recover(&args, &recovery, header.session, from, count)?;
                from += u64::from(count);
            }
        } else if header.sequence_number < next {
            continue;
        }

        let block = &buf[HEADER_SIZE..len];
        if first_ts.is_none() {
            if let Some(Ok(frame)) = itch::frames(block, 0).next() {
                first_ts = itch::extract_timestamp(&frame).ok();
                if let Some(ts) = first_ts {
                    info!(at = %ts, seq = header.sequence_number, "first packet");
                }
            }
        }
        if args.print_messages {
            print_messages(block, header.sequence_number)?;
        }
        stats.packets += 1;
        stats.messages += u64::from(header.message_count);
        expected = Some(header.sequence_number + u64::from(header.message_count));
    }

    info!(
        packets = stats.packets,
        messages = stats.messages,
        gaps = stats.gaps,
        requested = stats.requested,
        recovered = stats.recovered,
        interrupted = stop.load(Ordering::Relaxed),
        "feed finished"
    );
    Ok(())
}
