mod common;

use bytes::Bytes;
use common::{SESSION, fast_config, itch_frame, write_replay_file};
use mold_replay::mold::HEADER_SIZE;
use mold_replay::{DownstreamHeader, FeedDriver, ReplayConfig, ReplayError, RetransmissionServer, SequenceIndex};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    _dir: tempfile::TempDir,
    cfg: ReplayConfig,
    file: Bytes,
    index: Arc<SequenceIndex>,
    frames: Vec<Vec<u8>>,
}

/// Runs the feed over `count` frames of `filler` extra bytes so the index is populated.
fn replayed(count: u64, filler: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let frames: Vec<Vec<u8>> = (0..count)
        .map(|i| itch_frame(b'A', 5_000 + i * 10, filler + (i % 3) as usize))
        .collect();
    let file = write_replay_file(&dir.path().join("feed.itch"), &frames);
    let cfg = fast_config();
    let index = Arc::new(SequenceIndex::new(cfg.index_capacity).unwrap());
    FeedDriver::new(&cfg, file.clone(), Arc::clone(&index), Vec::new())
        .unwrap()
        .run()
        .unwrap();
    Fixture {
        _dir: dir,
        cfg,
        file,
        index,
        frames,
    }
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    socket
}

fn request(session: &str, seq: u64, count: u16) -> [u8; HEADER_SIZE] {
    DownstreamHeader::new(session.parse().unwrap(), seq, count).encode()
}

/// Collects response packets until `count` messages arrived or the socket times out.
fn collect(socket: &UdpSocket, count: u64) -> Vec<(DownstreamHeader, Vec<u8>)> {
    let mut out = Vec::new();
    let mut got = 0u64;
    let mut buf = [0u8; 2048];
    while got < count {
        let Ok(len) = socket.recv(&mut buf) else {
            break;
        };
        let header = DownstreamHeader::decode(&buf[..len]).unwrap();
        got += u64::from(header.message_count);
        out.push((header, buf[HEADER_SIZE..len].to_vec()));
    }
    out
}

#[test]
fn single_message_response_starts_at_indexed_offset() {
    let fx = replayed(20, 10);
    let server = RetransmissionServer::start(&fx.cfg, fx.file.clone(), Arc::clone(&fx.index)).unwrap();
    assert_eq!(server.workers(), 2);

    let socket = client();
    socket.send_to(&request(SESSION, 3, 1), server.local_addr()).unwrap();
    let packets = collect(&socket, 1);
    server.shutdown();

    assert_eq!(packets.len(), 1);
    let (header, block) = &packets[0];
    assert_eq!(header.sequence_number, 3);
    assert_eq!(header.message_count, 1);
    // The index stores the offset just past message 3.
    let offset = fx.index.lookup(3).unwrap();
    assert_eq!(offset, fx.frames[..3].concat().len());
    assert_eq!(block, &fx.frames[3]);
}

#[test]
fn large_request_spans_several_packets() {
    // 62-64 byte frames: at most 18 per packet.
    let fx = replayed(200, 49);
    let server = RetransmissionServer::start(&fx.cfg, fx.file.clone(), Arc::clone(&fx.index)).unwrap();

    let socket = client();
    socket.send_to(&request(SESSION, 10, 60), server.local_addr()).unwrap();
    let packets = collect(&socket, 60);
    server.shutdown();

    assert!(packets.len() >= 4);
    let mut next_seq = 10;
    let mut messages = Vec::new();
    for (header, block) in &packets {
        assert!(block.len() + HEADER_SIZE <= mold_replay::mold::MAX_PAYLOAD_SIZE);
        assert_eq!(header.sequence_number, next_seq);
        next_seq += u64::from(header.message_count);
        messages.extend_from_slice(block);
    }
    assert_eq!(next_seq, 70);
    assert_eq!(messages, fx.frames[10..70].concat());
}

#[test]
fn request_past_end_of_file_is_truncated() {
    let fx = replayed(8, 4);
    let server = RetransmissionServer::start(&fx.cfg, fx.file.clone(), Arc::clone(&fx.index)).unwrap();

    let socket = client();
    socket.send_to(&request(SESSION, 5, 100), server.local_addr()).unwrap();
    let packets = collect(&socket, 100);
    server.shutdown();

    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].0.message_count, 3);
    assert_eq!(packets[0].1, fx.frames[5..].concat());
}

#[test]
fn unserviceable_requests_are_dropped_silently() {
    let fx = replayed(8, 4);
    let server = RetransmissionServer::start(&fx.cfg, fx.file.clone(), Arc::clone(&fx.index)).unwrap();
    let addr = server.local_addr();
    let socket = client();
    let mut buf = [0u8; 2048];

    let valid = request(SESSION, 2, 1);
    socket.send_to(&valid[..HEADER_SIZE - 1], addr).unwrap();
    let mut long = valid.to_vec();
    long.push(0);
    socket.send_to(&long, addr).unwrap();
    socket.send_to(&request("OTHERSESS1", 2, 1), addr).unwrap();
    socket.send_to(&request(SESSION, 9, 1), addr).unwrap();
    socket.send_to(&request(SESSION, 0, 1), addr).unwrap();
    socket.send_to(&request(SESSION, 2, 0), addr).unwrap();
    assert!(socket.recv(&mut buf).is_err(), "no reply expected");

    socket.send_to(&valid, addr).unwrap();
    let len = socket.recv(&mut buf).unwrap();
    let header = DownstreamHeader::decode(&buf[..len]).unwrap();
    assert_eq!((header.sequence_number, header.message_count), (2, 1));
    server.shutdown();
}

#[test]
fn shutdown_wakes_idle_workers() {
    let fx = replayed(1, 0);
    let mut cfg = fx.cfg.clone();
    cfg.recovery_workers = 4;
    let server = RetransmissionServer::start(&cfg, fx.file.clone(), Arc::clone(&fx.index)).unwrap();
    assert_eq!(server.workers(), 4);
    std::thread::sleep(Duration::from_millis(20));
    server.shutdown();
}

#[test]
fn invalid_config_is_rejected_before_binding() {
    let fx = replayed(1, 0);
    let mut cfg = fx.cfg.clone();
    cfg.recovery_workers = 0;
    let started = RetransmissionServer::start(&cfg, fx.file.clone(), Arc::clone(&fx.index));
    assert!(matches!(started, Err(ReplayError::Config(_))));

    let mut cfg = fx.cfg.clone();
    cfg.replay_speed = f64::NAN;
    let started = RetransmissionServer::start(&cfg, fx.file.clone(), Arc::clone(&fx.index));
    assert!(matches!(started, Err(ReplayError::Config(_))));
}
