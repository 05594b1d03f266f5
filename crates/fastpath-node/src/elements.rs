//! Demo pipeline: generate, filter, digest on a coprocessor, verify

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fastpath_common::{AtomicCounter, Timestamp};
use fastpath_graph::{
    anno, AnnoSet, Dispatch, Element, OffloadTask, OffloadableElement, Packet, PacketBatch, SchedulableElement,
    Verdict,
};
use fastpath_offload::{Kernel, OffloadError, SharedLink, WorkContext};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// FNV-1a, 64 bit
pub fn fnv1a(data: &[u8]) -> u64 {
    data.iter()
        .fold(0xcbf2_9ce4_8422_2325, |h, &b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
}

/// Device kernel: one little-endian digest per packet
#[derive(Debug, Default)]
pub struct DigestKernel;

impl Kernel for DigestKernel {
    fn name(&self) -> &'static str {
        "fnv1a-digest"
    }

    fn process(&self, ctx: &mut WorkContext<'_>) {
        let mut buf = BytesMut::with_capacity(ctx.input.len() * 8);
        for pkt in ctx.input {
            buf.put_u64_le(fnv1a(pkt));
        }
        let mut digests = buf.freeze();
        while digests.has_remaining() {
            ctx.output.push(digests.split_to(8));
        }
    }
}

/// Synthetic traffic source
pub struct PacketGen {
    remaining: usize,
    batch_size: usize,
    flows: u64,
    state: u64,
}

impl PacketGen {
    pub fn new(batches: usize, batch_size: usize, flows: u64) -> Self {
        Self { remaining: batches, batch_size, flows: flows.max(1), state: 0x9e37_79b9_7f4a_7c15 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    fn next_rand(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.state >> 33
    }

    fn packet(&mut self) -> Packet {
        // 16..=112 byte payloads, a few below the filter threshold
        let len = 16 + (self.next_rand() % 97) as usize;
        let mut data = BytesMut::with_capacity(len);
        while data.len() < len {
            data.put_u8(self.next_rand() as u8);
        }
        let mut pkt = Packet::new(data);
        pkt.set_anno(anno::TIMESTAMP, Timestamp::now().as_nanos());
        pkt.set_anno(anno::FLOW_ID, self.next_rand() % self.flows);
        pkt
    }
}

impl Element for PacketGen {
    fn class_name(&self) -> &'static str {
        "PacketGen"
    }

    fn annotations_written(&self) -> AnnoSet {
        AnnoSet::of(&[anno::TIMESTAMP, anno::FLOW_ID])
    }

    fn process(&mut self, _input_port: usize, _batch: &mut PacketBatch) -> Verdict {
        Verdict::Forward(0)
    }

    fn as_schedulable_mut(&mut self) -> Option<&mut dyn SchedulableElement> {
        Some(self)
    }
}

impl SchedulableElement for PacketGen {
    fn poll(&mut self) -> Option<Vec<Packet>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some((0..self.batch_size).map(|_| self.packet()).collect())
    }
}

/// Drops packets shorter than `min_len`
pub struct LengthFilter {
    min_len: usize,
}

impl LengthFilter {
    pub fn new(min_len: usize) -> Self {
        Self { min_len }
    }
}

impl Element for LengthFilter {
    fn class_name(&self) -> &'static str {
        "LengthFilter"
    }

    fn process(&mut self, _input_port: usize, batch: &mut PacketBatch) -> Verdict {
        for pkt in batch.iter_mut() {
            if pkt.len() < self.min_len {
                pkt.drop_packet();
            }
        }
        Verdict::Classified
    }
}

/// Port that tasks with lost device results leave on
pub const LOST_PORT: usize = 1;

/// Computes per-packet digests on a coprocessor device.
///
/// A task goes to the device as one submission; its results are collected
/// on the first postprocess call and sliced per batch. When the results
/// cannot be collected, or come back short, the whole task leaves on
/// [`LOST_PORT`].
pub struct DigestOffload {
    link: SharedLink,
    min_batches: usize,
    max_age: Duration,
    counters: Arc<SinkCounters>,
    results: HashMap<u64, Vec<Bytes>>,
    lost: HashSet<u64>,
    finalized_lost: bool,
}

impl DigestOffload {
    pub fn new(link: SharedLink, min_batches: usize, max_age: Duration, counters: Arc<SinkCounters>) -> Self {
        Self {
            link,
            min_batches: min_batches.max(1),
            max_age,
            counters,
            results: HashMap::new(),
            lost: HashSet::new(),
            finalized_lost: false,
        }
    }

    fn fetch_results(&mut self, task: &OffloadTask, index: usize) {
        let task_id = task.id();
        if self.results.contains_key(&task_id) || self.lost.contains(&task_id) {
            return;
        }
        let mut link = self.link.lock();
        let collected = match task.ticket(index) {
            Some(ticket) => link.collect(ticket),
            None => Err(OffloadError::Protocol(format!("task {task_id} has no ticket for batch {index}"))),
        };
        match collected {
            Ok(results) if results.len() == task.num_packets() => {
                self.results.insert(task_id, results);
            }
            Ok(results) => {
                tracing::warn!(
                    device = link.device_id(),
                    task_id,
                    expected = task.num_packets(),
                    got = results.len(),
                    "digest results short"
                );
                self.lost.insert(task_id);
            }
            Err(e) => {
                tracing::warn!(device = link.device_id(), task_id, error = %e, "digest results lost");
                self.lost.insert(task_id);
            }
        }
    }
}

impl Element for DigestOffload {
    fn class_name(&self) -> &'static str {
        "DigestOffload"
    }

    fn num_outputs(&self) -> usize {
        2
    }

    fn annotations_read(&self) -> AnnoSet {
        AnnoSet::of(&[anno::FLOW_ID])
    }

    fn annotations_written(&self) -> AnnoSet {
        AnnoSet::of(&[anno::DIGEST])
    }

    /// In-line fallback for batches not worth offloading
    fn process(&mut self, _input_port: usize, batch: &mut PacketBatch) -> Verdict {
        for pkt in batch.iter_mut() {
            let digest = fnv1a(pkt.data());
            pkt.set_anno(anno::DIGEST, digest);
        }
        Verdict::Forward(0)
    }

    fn as_offloadable_mut(&mut self) -> Option<&mut dyn OffloadableElement> {
        Some(self)
    }
}

impl OffloadableElement for DigestOffload {
    fn wants_offload(&self, batch: &PacketBatch) -> bool {
        !batch.is_empty()
    }

    fn ready_to_dispatch(&self, pending_batches: usize, age: Duration) -> bool {
        pending_batches >= self.min_batches || age >= self.max_age
    }

    fn dispatch(&mut self, task: &mut OffloadTask) -> Dispatch {
        let payloads: Vec<Bytes> = task.packets().map(Packet::to_bytes).collect();
        let mut link = self.link.lock();
        match link.submit(&payloads) {
            Ok(ticket) => Dispatch::Whole(ticket),
            Err(OffloadError::NoFreeSlot(_)) => Dispatch::Deferred,
            Err(e) => {
                tracing::warn!(device = link.device_id(), task_id = task.id(), error = %e, "digest offload refused");
                Dispatch::Failed
            }
        }
    }

    fn postprocess(&mut self, task: &OffloadTask, index: usize, batch: &mut PacketBatch) {
        self.fetch_results(task, index);
        let offset = task.packet_offset(index);
        let Some(results) = self.results.get(&task.id()) else {
            return;
        };
        for (pkt, digest) in batch.iter_mut().zip(results.iter().skip(offset)) {
            let mut digest = digest.clone();
            if digest.remaining() >= 8 {
                pkt.set_anno(anno::DIGEST, digest.get_u64_le());
            }
        }
    }

    fn finalize(&mut self, task: &mut OffloadTask) {
        self.results.remove(&task.id());
        self.finalized_lost = self.lost.remove(&task.id());
        if self.finalized_lost {
            self.counters.lost_packets.add(task.num_packets() as u64);
        }
    }

    /// Asked right after `finalize` for the same task
    fn output_port(&self) -> usize {
        if self.finalized_lost {
            LOST_PORT
        } else {
            0
        }
    }
}

/// Sink counters, readable after the graph is gone
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub packets: AtomicCounter,
    pub bytes: AtomicCounter,
    pub mismatches: AtomicCounter,
    /// Packets dropped because their device results never came back
    pub lost_packets: AtomicCounter,
    /// Sum of packet latencies from generation to sink (nanoseconds)
    pub latency_ns: AtomicCounter,
}

/// Checks each digest against a host-side recomputation
pub struct VerifySink {
    counters: Arc<SinkCounters>,
}

impl VerifySink {
    pub fn new(counters: Arc<SinkCounters>) -> Self {
        Self { counters }
    }
}

impl Element for VerifySink {
    fn class_name(&self) -> &'static str {
        "VerifySink"
    }

    fn num_outputs(&self) -> usize {
        0
    }

    fn annotations_read(&self) -> AnnoSet {
        AnnoSet::of(&[anno::TIMESTAMP, anno::DIGEST])
    }

    fn process(&mut self, _input_port: usize, batch: &mut PacketBatch) -> Verdict {
        let now = Timestamp::now().as_nanos();
        for pkt in batch.iter() {
            if pkt.anno(anno::DIGEST) != fnv1a(pkt.data()) {
                self.counters.mismatches.inc();
            }
            self.counters.latency_ns.add(now.saturating_sub(pkt.anno(anno::TIMESTAMP)));
        }
        self.counters.packets.add(batch.len() as u64);
        self.counters.bytes.add(batch.bytes() as u64);
        Verdict::Drop
    }
}
