//! Bounded ring buffer shared by one producer and many subscribers.
//!
//! A fixed array of packet slots indexed by a monotonically increasing
//! producer sequence. The producer is the only writer; each subscriber
//! advances an independent cursor through the same slots and parks on a
//! condition variable when it catches up. One broadcast per write wakes
//! every waiting reader — including for the terminal EOF packet, so no
//! reader can be left blocked when the session ends.
//!
//! Overwrite safety rests on the capacity margin: a subscriber that falls
//! more than `lag_threshold` packets behind skips itself forward to
//! `write_index - lag_threshold` and realigns to the next keyframe, so no
//! cursor ever trails into the region the producer is about to reuse, and
//! the producer never blocks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::packet::{Packet, PacketKind};

#[derive(Debug)]
pub(crate) struct RingBuffer {
    state: Mutex<RingState>,
    readable: Condvar,
    capacity: i64,
    lag_threshold: i64,
}

#[derive(Debug)]
struct RingState {
    slots: Vec<Option<Arc<Packet>>>,
    /// Sequence of the most recently written packet; -1 before the first
    /// write. Slot for sequence `s` is `s % capacity`.
    write_index: i64,
}

impl RingBuffer {
    pub fn new(capacity: usize, lag_threshold: i64) -> Self {
        debug_assert!(lag_threshold >= 0 && (lag_threshold as usize) < capacity);
        Self {
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                write_index: -1,
            }),
            readable: Condvar::new(),
            capacity: capacity as i64,
            lag_threshold,
        }
    }

    /// Producer-only: publish the next packet and wake all readers.
    pub fn write(&self, kind: PacketKind, pts: Duration, data: Bytes) {
        let mut state = self.state.lock();
        let seq = state.write_index + 1;
        let slot = (seq % self.capacity) as usize;
        state.slots[slot] = Some(Arc::new(Packet::new(kind, pts, seq as u64, data)));
        state.write_index = seq;
        self.readable.notify_all();
    }

    /// Producer-only: publish the terminal EOF marker.
    pub fn write_eof(&self) {
        let mut state = self.state.lock();
        let seq = state.write_index + 1;
        let slot = (seq % self.capacity) as usize;
        state.slots[slot] = Some(Arc::new(Packet::eof(seq as u64)));
        state.write_index = seq;
        self.readable.notify_all();
    }

    /// Blocking read at the subscriber's cursor.
    ///
    /// A cursor of -1 means "not yet positioned": the read starts at the
    /// newest packet and scans forward to the next keyframe (or EOF), so
    /// the first video packet a subscriber observes is always a keyframe.
    /// A subscriber more than `lag_threshold` behind is skipped forward
    /// and realigned the same way.
    pub fn read(&self, cursor: &mut i64) -> Arc<Packet> {
        let mut state = self.state.lock();

        if *cursor < 0 {
            while state.write_index < 0 {
                self.readable.wait(&mut state);
            }
            *cursor = state.write_index;
            return self.align_to_keyframe(state, cursor);
        }

        *cursor += 1;
        if state.write_index - *cursor > self.lag_threshold {
            tracing::debug!(
                cursor = *cursor,
                write_index = state.write_index,
                "slow subscriber, skipping to newest keyframe"
            );
            *cursor = state.write_index - self.lag_threshold;
            return self.align_to_keyframe(state, cursor);
        }

        while *cursor > state.write_index {
            self.readable.wait(&mut state);
        }
        self.slot(&state, *cursor)
    }

    /// Advance `cursor` to the next `VideoKey` (or `Eof`) slot, waiting
    /// for the producer when the scan catches up with `write_index`.
    fn align_to_keyframe(
        &self,
        mut state: parking_lot::MutexGuard<'_, RingState>,
        cursor: &mut i64,
    ) -> Arc<Packet> {
        loop {
            let packet = self.slot(&state, *cursor);
            match packet.kind() {
                PacketKind::VideoKey | PacketKind::Eof => return packet,
                _ => {
                    *cursor += 1;
                    while *cursor > state.write_index {
                        self.readable.wait(&mut state);
                    }
                }
            }
        }
    }

    fn slot(&self, state: &RingState, seq: i64) -> Arc<Packet> {
        state.slots[(seq % self.capacity) as usize]
            .clone()
            .unwrap_or_else(|| Arc::new(Packet::eof(seq as u64)))
    }
}
