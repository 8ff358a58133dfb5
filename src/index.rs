//! Sequence number to file offset index shared by the feed and recovery workers.
//!
//! A fixed ring of `capacity` slots. Only one thread may push; any number of
//! threads may look up concurrently without locks. Each slot is guarded by a
//! sequence word in the manner of a seqlock: the writer invalidates the slot,
//! stores the offset, then stores the new sequence number. A reader accepts an
//! offset only if it sees the requested sequence number both before and after
//! reading it, so an overwrite racing with the read yields `None`, never a
//! stale offset.
use crate::error::{ReplayError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

/// Sequence numbers start at 1, so 0 marks both an empty index and a slot
/// being rewritten.
const EMPTY: u64 = 0;

#[derive(Default)]
struct Slot {
    seq: AtomicU64,
    file_pos: AtomicUsize,
}

#[repr(align(64))]
struct Watermark(AtomicU64);

pub struct SequenceIndex {
    slots: Box<[Slot]>,
    mask: u64,
    watermark: Watermark,
}

impl SequenceIndex {
    /// `capacity` must be a non-zero power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(ReplayError::IndexCapacity(capacity));
        }
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            watermark: Watermark(AtomicU64::new(EMPTY)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest sequence number published so far, `None` while empty.
    pub fn watermark(&self) -> Option<u64> {
        match self.watermark.0.load(Ordering::Acquire) {
            EMPTY => None,
            seq => Some(seq),
        }
    }

    /// Records the offset for `seq_num`.
    ///
    /// Must only be called from the single feed thread, with sequence numbers
    /// strictly increasing from 1.
    pub fn push(&self, seq_num: u64, file_pos: usize) {
        debug_assert!(seq_num != EMPTY, "sequence numbers start at 1");
        debug_assert!(
            seq_num > self.watermark.0.load(Ordering::Relaxed),
            "sequence numbers must increase"
        );
        let slot = &self.slots[(seq_num & self.mask) as usize];
        slot.seq.store(EMPTY, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.file_pos.store(file_pos, Ordering::Relaxed);
        slot.seq.store(seq_num, Ordering::Release);
        self.watermark.0.store(seq_num, Ordering::Release);
    }

    /// File offset recorded for `seq_num`, if still held by the ring.
    pub fn lookup(&self, seq_num: u64) -> Option<usize> {
        let current = self.watermark.0.load(Ordering::Acquire);
        if current == EMPTY
            || seq_num == EMPTY
            || seq_num > current
            || seq_num + self.capacity() as u64 <= current
        {
            return None;
        }

        let slot = &self.slots[(seq_num & self.mask) as usize];
        if slot.seq.load(Ordering::Acquire) != seq_num {
            return None;
        }
        let file_pos = slot.file_pos.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != seq_num {
            return None;
        }
        Some(file_pos)
    }
}
