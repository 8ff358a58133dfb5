//! MoldUDP64 retransmission service.
//!
//! A pool of workers, each on its own OS thread with its own single-threaded
//! tokio reactor and its own socket bound to the shared recovery port with
//! `SO_REUSEPORT`, so the kernel spreads requests across them. Every worker
//! waits on its socket and on one shared shutdown channel; raising shutdown
//! wakes all of them at once.
//!
//! Requests that cannot be served (malformed, wrong session, sequence not in
//! the index) are dropped without a reply. Clients are expected to retry.
use crate::config::ReplayConfig;
use crate::error::{ReplayError, Result};
use crate::index::SequenceIndex;
use crate::itch;
use crate::mold::{DownstreamHeader, PacketAssembler, RetransmissionRequest, Session};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Large enough to tell a well-formed request from an oversized datagram.
const REQUEST_BUFFER_SIZE: usize = 512;

pub struct RetransmissionServer {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RetransmissionServer {
    /// Binds every worker socket, then starts the workers.
    ///
    /// Binding happens on the calling thread so address errors surface here.
    /// When the configured port is 0 the first socket picks the port and the
    /// rest of the pool joins it.
    pub fn start(config: &ReplayConfig, file: Bytes, index: Arc<SequenceIndex>) -> Result<Self> {
        config.validate()?;
        let max_payload = config.max_payload()?;
        let first = bind_shared(config.recovery_addr)?;
        let local_addr = first.local_addr()?;
        let mut sockets = vec![first];
        for _ in 1..config.recovery_workers {
            sockets.push(bind_shared(local_addr)?);
        }

        let (shutdown, _) = watch::channel(false);
        let workers = sockets
            .into_iter()
            .enumerate()
            .map(|(id, socket)| {
                let worker = RecoveryWorker {
                    id,
                    session: config.session,
                    file: file.clone(),
                    index: Arc::clone(&index),
                    assembler: PacketAssembler::with_max_payload(config.session, max_payload)?,
                };
                let shutdown = shutdown.subscribe();
                thread::Builder::new()
                    .name(format!("recovery-{id}"))
                    .spawn(move || worker.run(socket, shutdown))
                    .map_err(ReplayError::Io)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(addr = %local_addr, workers = workers.len(), "retransmission service listening");
        Ok(Self {
            shutdown,
            workers,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker to stop and waits for them to exit.
    pub fn shutdown(self) {
        self.shutdown.send_replace(true);
        for handle in self.workers {
            if handle.join().is_err() {
                error!("recovery worker panicked");
            }
        }
        info!("retransmission service stopped");
    }
}

/// UDP socket that other sockets may bind to the same address.
fn bind_shared(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

struct RecoveryWorker {
    id: usize,
    session: Session,
    file: Bytes,
    index: Arc<SequenceIndex>,
    assembler: PacketAssembler,
}

impl RecoveryWorker {
    fn run(self, socket: std::net::UdpSocket, shutdown: watch::Receiver<bool>) {
        let id = self.id;
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(worker = id, error = %e, "failed to build reactor");
                return;
            }
        };
        if let Err(e) = runtime.block_on(self.serve(socket, shutdown)) {
            error!(worker = id, error = %e, "recovery worker failed");
        }
    }

    async fn serve(
        mut self,
        socket: std::net::UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let socket = UdpSocket::from_std(socket)?;
        let mut buf = [0u8; REQUEST_BUFFER_SIZE];
        debug!(worker = self.id, "recovery worker ready");

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.handle_datagram(&socket, &buf[..len], peer).await,
                    Err(e) => warn!(worker = self.id, error = %e, "recv failed"),
                },
            }
        }
        debug!(worker = self.id, "recovery worker exiting");
        Ok(())
    }

    async fn handle_datagram(&mut self, socket: &UdpSocket, datagram: &[u8], peer: SocketAddr) {
        let Some(request) = DownstreamHeader::parse_request(datagram) else {
            debug!(worker = self.id, %peer, len = datagram.len(), "malformed request dropped");
            return;
        };
        if request.session != self.session {
            debug!(worker = self.id, %peer, session = %request.session, "request for another session dropped");
            return;
        }
        if request.message_count == 0 {
            return;
        }
        let Some(file_pos) = self.index.lookup(request.sequence_number) else {
            debug!(worker = self.id, %peer, seq = request.sequence_number, "sequence not indexed");
            return;
        };
        let served = self.serve_range(socket, &request, file_pos, peer).await;
        debug!(
            worker = self.id,
            %peer,
            seq = request.sequence_number,
            requested = request.message_count,
            served,
            "retransmitted"
        );
    }

    /// Replays up to `request.message_count` frames from `file_pos`, in as many
    /// packets as needed. Returns the number of messages sent.
    async fn serve_range(
        &mut self,
        socket: &UdpSocket,
        request: &RetransmissionRequest,
        file_pos: usize,
        peer: SocketAddr,
    ) -> u64 {
        let wanted = u64::from(request.message_count);
        let mut served = 0u64;
        let mut cursor = file_pos;
        self.assembler.reset(request.sequence_number);

        while served < wanted {
            let frame = match itch::next_frame(&self.file, cursor) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "corrupt frame while serving recovery");
                    break;
                }
            };
            if !self.assembler.try_add_message(frame.as_bytes()) {
                if self.assembler.is_empty() {
                    warn!(worker = self.id, offset = frame.offset(), "frame larger than a packet");
                    break;
                }
                self.send(socket, peer).await;
                self.assembler.reset(request.sequence_number + served);
                continue;
            }
            cursor = frame.end();
            served += 1;
        }

        if !self.assembler.is_empty() {
            self.send(socket, peer).await;
        }
        served
    }

    async fn send(&mut self, socket: &UdpSocket, peer: SocketAddr) {
        let packet = self.assembler.finalize();
        match socket.send_to(packet, peer).await {
            Ok(sent) if sent != packet.len() => {
                warn!(worker = self.id, sent, expected = packet.len(), "partial retransmission send")
            }
            Ok(_) => {}
            Err(e) => warn!(worker = self.id, %peer, error = %e, "retransmission send failed"),
        }
    }
}
