mod common;

use common::{fast_config, itch_frame, write_replay_file};
use mold_replay::mold::{END_OF_SESSION, HEADER_SIZE};
use mold_replay::{DownstreamHeader, FeedDriver, MarketPhase, MulticastSink, ReplayError, SequenceIndex};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

#[test]
fn ten_frames_are_indexed_sent_and_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let frames: Vec<Vec<u8>> = (0..10u64)
        .map(|i| itch_frame(b'A', 1_000_000 + i * 1_000, 20))
        .collect();
    let file = write_replay_file(&dir.path().join("ten.itch"), &frames);

    let cfg = fast_config();
    let index = Arc::new(SequenceIndex::new(cfg.index_capacity).unwrap());
    let mut feed = FeedDriver::new(&cfg, file.clone(), Arc::clone(&index), Vec::new()).unwrap();
    let summary = feed.run().unwrap();

    assert_eq!(summary.messages, 10);
    assert_eq!(summary.next_sequence, 11);
    assert_eq!(index.watermark(), Some(10));
    let mut offset = 0;
    for (i, frame) in frames.iter().enumerate() {
        offset += frame.len();
        assert_eq!(index.lookup(i as u64 + 1), Some(offset));
    }

    let packets = feed.sink();
    let (data, eos): (Vec<_>, Vec<_>) = packets
        .iter()
        .map(|p| (DownstreamHeader::decode(p).unwrap(), p))
        .partition(|(h, _)| !h.is_end_of_session());
    assert!(!data.is_empty());

    let mut expected_seq = 1;
    let mut replayed = Vec::new();
    for (header, packet) in &data {
        assert_eq!(header.session.to_string(), common::SESSION);
        assert_eq!(header.sequence_number, expected_seq);
        expected_seq += u64::from(header.message_count);
        replayed.extend_from_slice(&packet[HEADER_SIZE..]);
    }
    assert_eq!(expected_seq, 11);
    assert_eq!(replayed, frames.concat());

    assert_eq!(eos.len() as u64, cfg.end_of_session.repeats());
    for (header, packet) in &eos {
        assert_eq!(packet.len(), HEADER_SIZE);
        assert_eq!(header.message_count, END_OF_SESSION);
        assert_eq!(header.sequence_number, 11);
    }
}

#[test]
fn start_phase_suppresses_but_still_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let open = MarketPhase::Open.start_timestamp().as_nanos();
    // 600 byte frames: one per packet.
    let frames: Vec<Vec<u8>> = [open - 2_000, open - 1_000, open, open + 1_000]
        .iter()
        .map(|ts| itch_frame(b'A', *ts, 600))
        .collect();
    let file = write_replay_file(&dir.path().join("open.itch"), &frames);

    let mut cfg = fast_config();
    cfg.start_phase = MarketPhase::Open;
    let index = Arc::new(SequenceIndex::new(cfg.index_capacity).unwrap());
    let mut feed = FeedDriver::new(&cfg, file, Arc::clone(&index), Vec::new()).unwrap();
    let summary = feed.run().unwrap();

    assert_eq!(summary.packets_suppressed, 2);
    assert_eq!(summary.packets_sent, 2);
    assert!(index.lookup(1).is_some());
    assert!(index.lookup(2).is_some());
    let first_sent = DownstreamHeader::decode(&feed.sink()[0]).unwrap();
    assert_eq!(first_sent.sequence_number, 3);
}

#[test]
fn timestamp_past_midnight_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let frames = vec![itch_frame(b'A', 24 * 3600 * 1_000_000_000, 0)];
    let file = write_replay_file(&dir.path().join("bad.itch"), &frames);
    let cfg = fast_config();
    let index = Arc::new(SequenceIndex::new(cfg.index_capacity).unwrap());
    let mut feed = FeedDriver::new(&cfg, file, index, Vec::new()).unwrap();
    let err = feed.run().unwrap_err();
    assert!(matches!(err, ReplayError::TimestampOutOfRange { .. }));
    assert!(feed.sink().is_empty());
}

#[test]
fn multicast_sink_requires_group_address() {
    let mut cfg = fast_config().downstream;
    cfg.group = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3400);
    assert!(matches!(MulticastSink::open(&cfg), Err(ReplayError::NotMulticast(_))));

    cfg.group = SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 9), 3401);
    let sink = MulticastSink::open(&cfg).unwrap();
    assert_eq!(sink.destination(), SocketAddr::V4(cfg.group));
}
