//! The live downstream feed.
//!
//! [`FeedDriver::run`] walks the replay file once, front to back. Every frame
//! it packs is given the next sequence number and published to the
//! [`SequenceIndex`] whether or not its packet is transmitted, so messages
//! before the start phase are still available for recovery.
use crate::config::{DownstreamConfig, EndOfSession, ReplayConfig};
use crate::error::{ReplayError, Result};
use crate::index::SequenceIndex;
use crate::itch::{self, Timestamp};
use crate::mold::{DownstreamHeader, HEADER_SIZE, PacketAssembler, Session};
use crate::pacer::ReplayPacer;
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Destination for finalized downstream packets.
pub trait PacketSink {
    /// Sends one datagram, returning the number of bytes accepted.
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

/// Keeps every packet in memory.
impl PacketSink for Vec<Vec<u8>> {
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.push(packet.to_vec());
        Ok(packet.len())
    }
}

/// Sends packets to the configured multicast group.
pub struct MulticastSink {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl MulticastSink {
    pub fn open(cfg: &DownstreamConfig) -> Result<Self> {
        if !cfg.group.ip().is_multicast() {
            return Err(ReplayError::NotMulticast(SocketAddr::V4(cfg.group)));
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(cfg.ttl)?;
        socket.set_multicast_loop_v4(cfg.loopback)?;
        Ok(Self {
            socket,
            dest: SocketAddr::V4(cfg.group),
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }
}

impl PacketSink for MulticastSink {
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send_to(packet, self.dest)
    }
}

/// Counters reported once the feed has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Messages packed and indexed.
    pub messages: u64,
    pub packets_sent: u64,
    /// Packets dropped because they precede the start phase.
    pub packets_suppressed: u64,
    /// Sequence number carried by the end-of-session announcement.
    pub next_sequence: u64,
}

pub struct FeedDriver<S: PacketSink> {
    session: Session,
    file: Bytes,
    index: Arc<SequenceIndex>,
    assembler: PacketAssembler,
    pacer: ReplayPacer,
    end_of_session: EndOfSession,
    sink: S,
}

impl<S: PacketSink> FeedDriver<S> {
    /// Fails if `config` does not pass [`ReplayConfig::validate`].
    pub fn new(config: &ReplayConfig, file: Bytes, index: Arc<SequenceIndex>, sink: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session: config.session,
            file,
            index,
            assembler: PacketAssembler::with_max_payload(config.session, config.max_payload()?)?,
            pacer: ReplayPacer::new(config.replay_speed, config.start_after()),
            end_of_session: config.end_of_session,
            sink,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Streams the whole file, then announces the end of the session.
    ///
    /// Corrupt input aborts the run before the announcement is sent.
    pub fn run(&mut self) -> Result<FeedSummary> {
        let file = self.file.clone();
        let mut seq_num = 1u64;
        let mut cursor = 0usize;
        let mut summary = FeedSummary::default();
        info!(session = %self.session, bytes = file.len(), "downstream feed starting");

        loop {
            self.assembler.reset(seq_num);
            let mut packet_timestamp: Option<Timestamp> = None;

            while let Some(frame) = itch::next_frame(&file, cursor)? {
                if !self.assembler.try_add_message(frame.as_bytes()) {
                    if self.assembler.is_empty() {
                        return Err(ReplayError::FrameTooLarge {
                            offset: frame.offset(),
                            len: frame.len(),
                            capacity: self.assembler.max_size() - HEADER_SIZE,
                        });
                    }
                    break;
                }
                if packet_timestamp.is_none() {
                    packet_timestamp = Some(itch::extract_timestamp(&frame)?);
                }
                cursor = frame.end();
                self.index.push(seq_num, cursor);
                seq_num += 1;
            }

            let Some(timestamp) = packet_timestamp else {
                break;
            };

            let was_started = self.pacer.started();
            match self.pacer.get_delay(timestamp) {
                Some(delay) => {
                    if !was_started {
                        info!(at = %timestamp, seq = self.assembler.sequence_number(), "live transmission starting");
                    }
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    self.send_packet();
                    summary.packets_sent += 1;
                }
                None => summary.packets_suppressed += 1,
            }
        }

        summary.messages = seq_num - 1;
        summary.next_sequence = seq_num;
        info!(
            messages = summary.messages,
            sent = summary.packets_sent,
            suppressed = summary.packets_suppressed,
            "replay file exhausted"
        );
        self.announce_end_of_session(seq_num);
        Ok(summary)
    }

    fn send_packet(&mut self) {
        let seq = self.assembler.sequence_number();
        let packet = self.assembler.finalize();
        match self.sink.send_packet(packet) {
            Ok(sent) if sent != packet.len() => {
                warn!(sent, expected = packet.len(), "partial downstream send")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, seq, "downstream send failed"),
        }
    }

    fn announce_end_of_session(&mut self, next_seq: u64) {
        let packet = DownstreamHeader::end_of_session(self.session, next_seq).encode();
        let repeats = self.end_of_session.repeats();
        debug!(seq = next_seq, repeats, "announcing end of session");
        for _ in 0..repeats {
            if let Err(e) = self.sink.send_packet(&packet) {
                warn!(error = %e, "end-of-session send failed");
            }
            thread::sleep(self.end_of_session.interval);
        }
    }
}
