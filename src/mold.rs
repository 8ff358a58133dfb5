//! MoldUDP64 wire format and packet assembly.
//!
//! Downstream packets and retransmission requests share one 20 byte header:
//!
//! ```text
//! offset  size  field
//!      0    10  session id (ASCII, space padded by convention)
//!     10     8  sequence number of the first message, big-endian
//!     18     2  message count, big-endian (0xFFFF = end of session)
//! ```
//!
//! Downstream packets follow the header with the messages exactly as framed
//! in the replay file: `[len:u16 BE][message]`.
use crate::error::{ReplayError, Result};
use std::fmt;
use std::str::FromStr;

pub const SESSION_ID_SIZE: usize = 10;
pub const HEADER_SIZE: usize = SESSION_ID_SIZE + 8 + 2;

/// Default MTU, left with some headroom for tunnels.
pub const MTU_SIZE: usize = 1200;
/// IPv4 + UDP header overhead.
pub const UDP_HEADER_SIZE: usize = 28;
pub const MAX_PAYLOAD_SIZE: usize = MTU_SIZE - UDP_HEADER_SIZE;
pub const MAX_MESSAGE_BLOCK_SIZE: usize = MAX_PAYLOAD_SIZE - HEADER_SIZE;

/// Message count announcing the end of a session.
pub const END_OF_SESSION: u16 = 0xFFFF;

/// Largest datagram payload a UDP socket can carry over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Packet payload budget for a given MTU.
pub fn max_payload_for_mtu(mtu: usize) -> Result<usize> {
    let payload = mtu
        .checked_sub(UDP_HEADER_SIZE)
        .filter(|p| *p > HEADER_SIZE && *p <= MAX_UDP_PAYLOAD)
        .ok_or_else(|| ReplayError::Config(format!("mtu {mtu} leaves no room for a MoldUDP64 packet")))?;
    Ok(payload)
}

/// Fixed-width MoldUDP64 session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session([u8; SESSION_ID_SIZE]);

impl Session {
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Session(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl FromStr for Session {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; SESSION_ID_SIZE] =
            s.as_bytes().try_into().map_err(|_| ReplayError::SessionLength {
                session: s.to_string(),
                len: s.len(),
                expected: SESSION_ID_SIZE,
            })?;
        Ok(Session(bytes))
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// The MoldUDP64 header, held in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownstreamHeader {
    pub session: Session,
    pub sequence_number: u64,
    pub message_count: u16,
}

/// Requests reuse the downstream header layout: the sequence number is the
/// first message wanted, the count is how many.
pub type RetransmissionRequest = DownstreamHeader;

impl DownstreamHeader {
    pub fn new(session: Session, sequence_number: u64, message_count: u16) -> Self {
        Self {
            session,
            sequence_number,
            message_count,
        }
    }

    pub fn end_of_session(session: Session, sequence_number: u64) -> Self {
        Self::new(session, sequence_number, END_OF_SESSION)
    }

    pub fn is_end_of_session(&self) -> bool {
        self.message_count == END_OF_SESSION
    }

    /// Writes the header in network byte order into the first 20 bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        out[..SESSION_ID_SIZE].copy_from_slice(self.session.as_bytes());
        out[SESSION_ID_SIZE..SESSION_ID_SIZE + 8].copy_from_slice(&self.sequence_number.to_be_bytes());
        out[SESSION_ID_SIZE + 8..HEADER_SIZE].copy_from_slice(&self.message_count.to_be_bytes());
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.write_to(&mut out);
        out
    }

    /// Decodes the header at the start of `bytes`; trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_SIZE)?;
        let mut session = [0u8; SESSION_ID_SIZE];
        session.copy_from_slice(&header[..SESSION_ID_SIZE]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&header[SESSION_ID_SIZE..SESSION_ID_SIZE + 8]);
        let count = [header[SESSION_ID_SIZE + 8], header[SESSION_ID_SIZE + 9]];
        Some(Self {
            session: Session::from_bytes(session),
            sequence_number: u64::from_be_bytes(seq),
            message_count: u16::from_be_bytes(count),
        })
    }

    /// Parses a retransmission request datagram, which must be exactly one header.
    pub fn parse_request(datagram: &[u8]) -> Option<RetransmissionRequest> {
        if datagram.len() != HEADER_SIZE {
            return None;
        }
        Self::decode(datagram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Accepting messages.
    Building,
    /// Header written; bytes are ready to send.
    Sealed,
}

/// Builds one downstream packet at a time into a reusable buffer.
pub struct PacketAssembler {
    buf: Box<[u8]>,
    len: usize,
    header: DownstreamHeader,
    state: AssemblerState,
}

impl PacketAssembler {
    /// Assembler bounded by the default MTU.
    pub fn new(session: Session) -> Self {
        Self::build(session, MAX_PAYLOAD_SIZE)
    }

    /// Assembler bounded by `max_payload` bytes per packet, header included.
    pub fn with_max_payload(session: Session, max_payload: usize) -> Result<Self> {
        if max_payload <= HEADER_SIZE || max_payload > MAX_UDP_PAYLOAD {
            return Err(ReplayError::Config(format!(
                "packet payload limit {max_payload} must be in {}..={MAX_UDP_PAYLOAD}",
                HEADER_SIZE + 1
            )));
        }
        Ok(Self::build(session, max_payload))
    }

    fn build(session: Session, max_payload: usize) -> Self {
        Self {
            buf: vec![0u8; max_payload].into_boxed_slice(),
            len: HEADER_SIZE,
            header: DownstreamHeader::new(session, 0, 0),
            state: AssemblerState::Building,
        }
    }

    /// Empties the packet and starts it at `sequence_number`.
    pub fn reset(&mut self, sequence_number: u64) {
        self.header.sequence_number = sequence_number;
        self.header.message_count = 0;
        self.len = HEADER_SIZE;
        self.state = AssemblerState::Building;
    }

    /// Appends `message` if the packet stays within its size limit.
    ///
    /// `false` means the packet is full (or sealed); nothing was changed.
    pub fn try_add_message(&mut self, message: &[u8]) -> bool {
        if self.state != AssemblerState::Building
            || self.len + message.len() > self.buf.len()
            || self.header.message_count == END_OF_SESSION - 1
        {
            return false;
        }
        self.buf[self.len..self.len + message.len()].copy_from_slice(message);
        self.len += message.len();
        self.header.message_count += 1;
        true
    }

    /// Writes the header and returns the transmission-ready packet.
    pub fn finalize(&mut self) -> &[u8] {
        self.header.write_to(&mut self.buf[..HEADER_SIZE]);
        self.state = AssemblerState::Sealed;
        &self.buf[..self.len]
    }

    pub fn message_block(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.header.message_count == 0
    }

    pub fn max_size(&self) -> usize {
        self.buf.len()
    }

    pub fn session(&self) -> Session {
        self.header.session
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    pub fn message_count(&self) -> u16 {
        self.header.message_count
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }
}
