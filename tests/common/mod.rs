#![allow(dead_code)]

use bytes::Bytes;
use memmap2::Mmap;
use mold_replay::{EndOfSession, ReplayConfig};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

pub const SESSION: &str = "TESTSESS01";

/// One ITCH-style frame: `[len][type][locate:2][tracking:2][ts:6][filler]`.
pub fn itch_frame(msg_type: u8, nanos: u64, filler: usize) -> Vec<u8> {
    let mut msg = vec![msg_type, 0, 7, 0, 1];
    msg.extend_from_slice(&nanos.to_be_bytes()[2..]);
    msg.extend((0..filler).map(|i| i as u8));
    let mut frame = (msg.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(&msg);
    frame
}

/// Writes the frames to `path` and maps the file back, as the server does.
pub fn write_replay_file(path: &Path, frames: &[Vec<u8>]) -> Bytes {
    let mut w = BufWriter::new(File::create(path).unwrap());
    for frame in frames {
        w.write_all(frame).unwrap();
    }
    w.flush().unwrap();
    drop(w);
    let f = File::open(path).unwrap();
    let mmap = unsafe { Mmap::map(&f) }.unwrap();
    Bytes::from_owner(mmap)
}

pub fn fast_config() -> ReplayConfig {
    let mut cfg = ReplayConfig::new(SESSION.parse().unwrap());
    cfg.replay_speed = 1_000.0;
    cfg.index_capacity = 1 << 10;
    cfg.recovery_addr = "127.0.0.1:0".parse().unwrap();
    cfg.recovery_workers = 2;
    cfg.end_of_session = EndOfSession {
        interval: Duration::from_millis(2),
        duration: Duration::from_millis(10),
    };
    cfg
}
