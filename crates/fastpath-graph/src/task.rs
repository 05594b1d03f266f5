//! Offload tasks

use crate::batch::PacketBatch;
use crate::element::{ElementId, SlotId};
use crate::packet::Packet;
use fastpath_offload::CompletionTicket;
use std::time::{Duration, Instant};

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Open; the element keeps absorbing batches
    Aggregating,
    /// Handed to the device, waiting for completions
    Dispatched,
}

/// Batches aggregated by one offloadable element for one device dispatch.
///
/// The task owns its batches until finalization hands them back to the
/// graph.
#[derive(Debug)]
pub struct OffloadTask {
    id: u64,
    element: ElementId,
    device_type: usize,
    input_port: usize,
    batches: Vec<PacketBatch>,
    slots: Vec<SlotId>,
    tickets: Vec<CompletionTicket>,
    phase: TaskPhase,
    created: Instant,
}

impl OffloadTask {
    pub(crate) fn new(id: u64, element: ElementId, device_type: usize, input_port: usize) -> Self {
        Self {
            id,
            element,
            device_type,
            input_port,
            batches: Vec::new(),
            slots: Vec::new(),
            tickets: Vec::new(),
            phase: TaskPhase::Aggregating,
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Element that owns the task
    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn device_type(&self) -> usize {
        self.device_type
    }

    /// Input port the batches arrived on
    pub fn input_port(&self) -> usize {
        self.input_port
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    /// Time since the first batch was absorbed
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Number of batches (slots)
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[PacketBatch] {
        &self.batches
    }

    pub fn batch(&self, index: usize) -> &PacketBatch {
        &self.batches[index]
    }

    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> SlotId {
        self.slots[index]
    }

    /// Completion for batch `index`, once dispatched
    pub fn ticket(&self, index: usize) -> Option<&CompletionTicket> {
        self.tickets.get(index)
    }

    pub fn num_packets(&self) -> usize {
        self.batches.iter().map(PacketBatch::len).sum()
    }

    /// Every packet in slot order
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.batches.iter().flat_map(PacketBatch::iter)
    }

    /// Index of the first packet of batch `index` within `packets()`
    pub fn packet_offset(&self, index: usize) -> usize {
        self.batches[..index].iter().map(PacketBatch::len).sum()
    }

    pub(crate) fn absorb(&mut self, batch: PacketBatch, slot: SlotId) {
        debug_assert_eq!(self.phase, TaskPhase::Aggregating);
        self.batches.push(batch);
        self.slots.push(slot);
    }

    pub(crate) fn batch_mut(&mut self, index: usize) -> &mut PacketBatch {
        &mut self.batches[index]
    }

    pub(crate) fn lend_batch(&mut self, index: usize) -> PacketBatch {
        std::mem::take(&mut self.batches[index])
    }

    pub(crate) fn return_batch(&mut self, index: usize, batch: PacketBatch) {
        self.batches[index] = batch;
    }

    pub(crate) fn set_dispatched(&mut self, tickets: Vec<CompletionTicket>) {
        assert_eq!(tickets.len(), self.batches.len(), "task {} needs one completion per slot", self.id);
        self.tickets = tickets;
        self.phase = TaskPhase::Dispatched;
    }

    pub(crate) fn into_batches(self) -> Vec<PacketBatch> {
        self.batches
    }
}
