//! Selective-repeat send window.
//!
//! `WINDOW_SIZE` slots indexed by `seq % WINDOW_SIZE`. Each live slot keeps
//! the buffered frame, its last send time, and whether it has been
//! acknowledged or retransmitted. `base` is the lowest unacknowledged seq
//! and `next_seq` the next to transmit; `base <= next_seq <= total` and
//! `next_seq - base <= WINDOW_SIZE` hold between calls. Once `base` slides
//! past a seq, that seq is never sent again.

use std::time::{Duration, Instant};

use crate::frame::Frame;

/// Number of frames that may be in flight at once.
pub const WINDOW_SIZE: usize = 5;

#[derive(Debug, Clone)]
struct Slot {
    frame: Frame,
    sent_at: Instant,
    acked: bool,
    retransmitted: bool,
}

/// What `mark_ack` observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckOutcome {
    /// First acknowledgement of this seq.
    pub newly_acked: bool,
    /// `base` moved forward.
    pub advanced: bool,
    /// Round-trip sample, present only for a first ack of a slot that was
    /// never retransmitted.
    pub sample: Option<Duration>,
}

#[derive(Debug)]
pub struct SendWindow {
    slots: [Option<Slot>; WINDOW_SIZE],
    base: u32,
    next_seq: u32,
    total: u32,
}

impl SendWindow {
    pub fn new(total: u32) -> Self {
        Self { slots: Default::default(), base: 0, next_seq: 0, total }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Every frame has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base >= self.total
    }

    /// Room for another frame.
    pub fn can_open(&self) -> bool {
        self.next_seq - self.base < WINDOW_SIZE as u32 && self.next_seq < self.total
    }

    /// Frames currently unacknowledged.
    pub fn in_flight(&self) -> u32 {
        self.next_seq - self.base
    }

    /// Store `frame` in the next slot and stamp it sent at `now`. Returns
    /// false when the window is full or the input is exhausted.
    pub fn open_slot(&mut self, frame: Frame, now: Instant) -> bool {
        if !self.can_open() {
            return false;
        }
        let idx = self.next_seq as usize % WINDOW_SIZE;
        self.slots[idx] = Some(Slot { frame, sent_at: now, acked: false, retransmitted: false });
        self.next_seq += 1;
        true
    }

    /// Apply an acknowledgement. Duplicate and out-of-window acks are
    /// no-ops, so the call is idempotent.
    pub fn mark_ack(&mut self, seq: u32, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        if seq < self.base || seq >= self.next_seq {
            return outcome;
        }
        let idx = seq as usize % WINDOW_SIZE;
        let Some(slot) = self.slots[idx].as_mut() else {
            return outcome;
        };
        if slot.acked {
            return outcome;
        }
        slot.acked = true;
        outcome.newly_acked = true;
        if !slot.retransmitted {
            outcome.sample = Some(now.duration_since(slot.sent_at));
        }
        while self.base < self.next_seq {
            let idx = self.base as usize % WINDOW_SIZE;
            match &self.slots[idx] {
                Some(slot) if slot.acked => {
                    self.slots[idx] = None;
                    self.base += 1;
                    outcome.advanced = true;
                }
                _ => break,
            }
        }
        outcome
    }

    /// Frames overdue for retransmission, ascending by seq. Each returned
    /// frame has its slot restamped to `now` and flagged as retransmitted;
    /// the caller must put it back on the wire.
    pub fn due_retransmits(&mut self, now: Instant, rto: Duration) -> Vec<Frame> {
        let mut due = Vec::new();
        for seq in self.base..self.next_seq {
            let idx = seq as usize % WINDOW_SIZE;
            if let Some(slot) = self.slots[idx].as_mut() {
                if !slot.acked && now.duration_since(slot.sent_at) > rto {
                    slot.sent_at = now;
                    slot.retransmitted = true;
                    due.push(slot.frame.clone());
                }
            }
        }
        due
    }
}
