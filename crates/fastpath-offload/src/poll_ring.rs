//! Completion poll ring
//!
//! A fixed array of per-slot sequence counters. The device side posts a
//! monotonically increasing sequence number into a slot when the task in
//! that slot completes; the dispatch side polls for the number it expects.
//! No acknowledgement flows back: the next dispatch into the slot simply
//! expects a higher number.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-length ring of completion sequence counters
#[derive(Debug)]
pub struct PollRing {
    slots: Box<[CachePadded<AtomicU64>]>,
    remote_window: u64,
    failed: AtomicBool,
}

impl PollRing {
    /// Create a ring of `len` slots, all at sequence 0.
    ///
    /// `remote_window` is the offset at which the ring is exposed to the
    /// peer; it is carried for diagnostics and the rendezvous handshake.
    pub fn new(len: usize, remote_window: u64) -> Self {
        assert!(len > 0, "poll ring needs at least one slot");
        let slots = (0..len).map(|_| CachePadded::new(AtomicU64::new(0))).collect();
        Self {
            slots,
            remote_window,
            failed: AtomicBool::new(false),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; rings have at least one slot
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Exposed offset of the ring
    pub fn remote_window(&self) -> u64 {
        self.remote_window
    }

    /// Producer: publish completion `seq` for `slot`.
    ///
    /// Result buffers written before this call are visible to a consumer
    /// that observes `seq`.
    #[inline]
    pub fn post(&self, slot: usize, seq: u64) {
        let cell = &self.slots[slot];
        debug_assert!(cell.load(Ordering::Relaxed) <= seq, "poll ring sequence went backwards");
        cell.store(seq, Ordering::Release);
    }

    /// Consumer: has `slot` reached `seq`?
    #[inline]
    pub fn is_posted(&self, slot: usize, seq: u64) -> bool {
        self.slots[slot].load(Ordering::Acquire) >= seq
    }

    /// Last sequence number posted to `slot`
    #[inline]
    pub fn current(&self, slot: usize) -> u64 {
        self.slots[slot].load(Ordering::Acquire)
    }

    /// Mark the producer side as gone; outstanding tickets will never complete
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Whether the producer side is gone
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Handle on one expected completion
#[derive(Debug, Clone)]
pub struct CompletionTicket {
    ring: Arc<PollRing>,
    slot: usize,
    seq: u64,
    task_id: u64,
}

impl CompletionTicket {
    /// Expect `seq` on `slot` of `ring`
    pub fn new(ring: Arc<PollRing>, slot: usize, seq: u64, task_id: u64) -> Self {
        assert!(slot < ring.len(), "ticket slot {slot} out of ring bounds");
        Self { ring, slot, seq, task_id }
    }

    /// Non-blocking completion check
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ring.is_posted(self.slot, self.seq)
    }

    /// The device behind this ticket is gone and the ticket is not ready
    #[inline]
    pub fn is_failed(&self) -> bool {
        !self.is_ready() && self.ring.is_failed()
    }

    /// Ring slot
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Expected sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Device task id
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// The ring this ticket polls
    pub fn ring(&self) -> &Arc<PollRing> {
        &self.ring
    }
}
