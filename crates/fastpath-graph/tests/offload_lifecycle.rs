//! Offload task lifecycle through the element graph

use fastpath_graph::{
    anno, AnnoSet, Dispatch, Element, ElementGraph, ElementId, OffloadTask, OffloadableElement, Packet, PacketBatch,
    SchedulableElement, TaskPhase, Verdict,
};
use fastpath_offload::{CompletionTicket, PollRing};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Log {
    dispatched: usize,
    preprocessed: Vec<u64>,
    postprocessed: Vec<usize>,
    finalized: Vec<u64>,
    /// First payload byte of every batch the sink saw
    sunk: Vec<u8>,
}

type SharedLog = Arc<Mutex<Log>>;

struct Source;

impl Element for Source {
    fn class_name(&self) -> &'static str {
        "Source"
    }
    fn annotations_written(&self) -> AnnoSet {
        AnnoSet::of(&[anno::FLOW_ID])
    }
    fn process(&mut self, _input_port: usize, batch: &mut PacketBatch) -> Verdict {
        for pkt in batch.iter_mut() {
            let flow = u64::from(pkt.data()[0]);
            pkt.set_anno(anno::FLOW_ID, flow);
        }
        Verdict::Forward(0)
    }
    fn as_schedulable_mut(&mut self) -> Option<&mut dyn SchedulableElement> {
        Some(self)
    }
}

impl SchedulableElement for Source {
    fn poll(&mut self) -> Option<Vec<Packet>> {
        None
    }
}

struct Passthrough;

impl Element for Passthrough {
    fn class_name(&self) -> &'static str {
        "Passthrough"
    }
    fn process(&mut self, _input_port: usize, _batch: &mut PacketBatch) -> Verdict {
        Verdict::Forward(0)
    }
}

enum Mode {
    PerSlot,
    Whole,
    DeferOnce,
    Refuse,
}

/// Writes a digest annotation on the "device" side: every slot gets its
/// own ring slot, completed by the test
struct Digest {
    ring: Arc<PollRing>,
    batch_threshold: usize,
    mode: Mode,
    log: SharedLog,
}

impl Element for Digest {
    fn class_name(&self) -> &'static str {
        "Digest"
    }
    fn annotations_read(&self) -> AnnoSet {
        AnnoSet::of(&[anno::FLOW_ID])
    }
    fn annotations_written(&self) -> AnnoSet {
        AnnoSet::of(&[anno::DIGEST])
    }
    fn process(&mut self, _input_port: usize, _batch: &mut PacketBatch) -> Verdict {
        Verdict::Forward(0)
    }
    fn as_offloadable_mut(&mut self) -> Option<&mut dyn OffloadableElement> {
        Some(self)
    }
}

impl OffloadableElement for Digest {
    fn wants_offload(&self, batch: &PacketBatch) -> bool {
        !batch.is_empty()
    }

    fn ready_to_dispatch(&self, pending_batches: usize, _age: Duration) -> bool {
        pending_batches >= self.batch_threshold
    }

    fn preprocess(&mut self, batch: &mut PacketBatch) {
        self.log.lock().unwrap().preprocessed.push(batch.id());
    }

    fn dispatch(&mut self, task: &mut OffloadTask) -> Dispatch {
        self.log.lock().unwrap().dispatched += 1;
        match self.mode {
            Mode::PerSlot => Dispatch::PerSlot(
                (0..task.len())
                    .map(|i| CompletionTicket::new(self.ring.clone(), i, task.id(), task.id()))
                    .collect(),
            ),
            Mode::Whole => Dispatch::Whole(CompletionTicket::new(self.ring.clone(), 0, task.id(), task.id())),
            Mode::DeferOnce => {
                self.mode = Mode::PerSlot;
                Dispatch::Deferred
            }
            Mode::Refuse => Dispatch::Failed,
        }
    }

    fn postprocess(&mut self, task: &OffloadTask, index: usize, batch: &mut PacketBatch) {
        assert_eq!(task.phase(), TaskPhase::Dispatched);
        assert!(task.ticket(index).is_some_and(CompletionTicket::is_ready));
        for pkt in batch.iter_mut() {
            let digest = pkt.anno(anno::FLOW_ID).wrapping_mul(31);
            pkt.set_anno(anno::DIGEST, digest);
        }
        self.log.lock().unwrap().postprocessed.push(index);
    }

    fn finalize(&mut self, task: &mut OffloadTask) {
        assert!(task.packets().all(|p| p.anno(anno::DIGEST) == p.anno(anno::FLOW_ID) * 31));
        self.log.lock().unwrap().finalized.push(task.id());
    }
}

struct Sink {
    log: SharedLog,
}

impl Element for Sink {
    fn class_name(&self) -> &'static str {
        "Sink"
    }
    fn num_outputs(&self) -> usize {
        0
    }
    fn annotations_read(&self) -> AnnoSet {
        AnnoSet::of(&[anno::DIGEST])
    }
    fn process(&mut self, _input_port: usize, batch: &mut PacketBatch) -> Verdict {
        self.log.lock().unwrap().sunk.push(batch.packets()[0].data()[0]);
        Verdict::Drop
    }
}

struct Pipeline {
    graph: ElementGraph,
    source: ElementId,
    digest: ElementId,
    ring: Arc<PollRing>,
    log: SharedLog,
}

fn pipeline(batch_threshold: usize, mode: Mode) -> Pipeline {
    let ring = Arc::new(PollRing::new(16, 0));
    let log = SharedLog::default();
    let mut graph = ElementGraph::default();
    let source = graph.add_element(Source).unwrap();
    let pass = graph.add_element(Passthrough).unwrap();
    let digest = graph
        .add_element(Digest { ring: ring.clone(), batch_threshold, mode, log: log.clone() })
        .unwrap();
    let sink = graph.add_element(Sink { log: log.clone() }).unwrap();
    graph.link_element(pass, 0, source, 0).unwrap();
    graph.link_element(digest, 0, pass, 0).unwrap();
    graph.link_element(sink, 0, digest, 0).unwrap();
    graph.validate().unwrap();
    Pipeline { graph, source, digest, ring, log }
}

/// Batch `tag` with `n` packets whose first byte is `tag`
fn batch(tag: u8, n: usize) -> PacketBatch {
    PacketBatch::new((0..n).map(|i| Packet::from_slice(&[tag, i as u8])).collect())
}

fn pump(graph: &mut ElementGraph) {
    graph.flush_offloaded_tasks();
    graph.flush_tasks();
}

#[test]
fn test_single_batch_of_ten() {
    let Pipeline { mut graph, source, digest, ring, log } = pipeline(1, Mode::PerSlot);
    graph.enqueue_batch(batch(3, 10), source, 0);
    graph.flush_tasks();
    assert!(graph.check_preproc(digest, 0));

    assert_eq!(graph.scan_offloadable_elements(), 1);
    assert_eq!(log.lock().unwrap().dispatched, 1);
    assert!(!graph.check_postproc(digest, 0));
    pump(&mut graph);
    assert!(!graph.check_postproc(digest, 0));

    ring.post(0, 1);
    assert!(graph.check_postproc(digest, 0));
    pump(&mut graph);
    assert!(graph.check_postproc_all(digest));
    assert_eq!(graph.stats().tasks_released, 1);
    assert_eq!(graph.stats().packets_freed, 10);
    assert_eq!(log.lock().unwrap().dispatched, 1);
}

#[test]
fn test_ten_packets_end_to_end() {
    let Pipeline { mut graph, source, digest, ring, log } = pipeline(2, Mode::PerSlot);
    assert!(graph.check_next_offloadable(graph.get_first_next(source).unwrap()));

    graph.enqueue_batch(batch(1, 5), source, 0);
    graph.enqueue_batch(batch(2, 5), source, 0);
    graph.flush_tasks();
    assert_eq!(graph.open_tasks(), 1);
    assert_eq!(graph.stats().batches_absorbed, 2);
    assert!(graph.check_preproc(digest, 0));
    assert!(graph.check_preproc(digest, 1));

    assert_eq!(graph.scan_offloadable_elements(), 1);
    assert!(!graph.check_preproc(digest, 0));
    assert!(!graph.check_postproc(digest, 0));
    assert_eq!(graph.pending_tasks(), 1);
    assert_eq!(log.lock().unwrap().preprocessed.len(), 2);

    // Nothing completed yet
    assert_eq!(graph.flush_offloaded_tasks(), 0);
    assert!(!graph.check_postproc_all(digest));

    ring.post(0, 1);
    assert!(graph.check_postproc(digest, 0));
    assert!(!graph.check_postproc(digest, 1));
    pump(&mut graph);
    assert_eq!(log.lock().unwrap().postprocessed, vec![0]);
    assert!(!graph.check_postproc_all(digest));
    assert_eq!(graph.pending_tasks(), 1);

    ring.post(1, 1);
    pump(&mut graph);
    assert!(graph.check_postproc_all(digest));
    assert!(graph.is_idle());

    let log = log.lock().unwrap();
    assert_eq!(log.postprocessed, vec![0, 1]);
    assert_eq!(log.finalized, vec![1]);
    assert_eq!(log.sunk, vec![1, 2]);

    let stats = graph.stats();
    assert_eq!(stats.tasks_dispatched, 1);
    assert_eq!(stats.tasks_released, 1);
    assert_eq!(stats.batches_resumed, 2);
    assert_eq!(stats.packets_freed, 10);
    assert_eq!(stats.live_batches(), 0);
    assert!(graph.offload_state().is_empty());
}

#[test]
fn test_whole_task_ticket() {
    let Pipeline { mut graph, source, ring, log, .. } = pipeline(3, Mode::Whole);
    for tag in 0..3 {
        graph.enqueue_batch(batch(tag, 2), source, 0);
    }
    graph.flush_tasks();
    assert_eq!(graph.scan_offloadable_elements(), 1);

    ring.post(0, 1);
    pump(&mut graph);
    assert_eq!(log.lock().unwrap().postprocessed, vec![0, 1, 2]);
    assert_eq!(log.lock().unwrap().sunk, vec![0, 1, 2]);
    assert!(graph.is_idle());
}

#[test]
fn test_not_ready_task_keeps_aggregating() {
    let Pipeline { mut graph, source, digest, ring, log } = pipeline(3, Mode::PerSlot);
    graph.enqueue_batch(batch(7, 1), source, 0);
    graph.flush_tasks();
    assert_eq!(graph.scan_offloadable_elements(), 0);
    assert!(graph.check_preproc(digest, 0));
    assert!(log.lock().unwrap().preprocessed.is_empty());

    graph.enqueue_batch(batch(8, 1), source, 0);
    graph.enqueue_batch(batch(9, 1), source, 0);
    graph.flush_tasks();
    assert_eq!(graph.scan_offloadable_elements(), 1);
    for slot in 0..3 {
        ring.post(slot, 1);
    }
    pump(&mut graph);
    assert_eq!(log.lock().unwrap().sunk, vec![7, 8, 9]);
}

#[test]
fn test_deferred_dispatch_retries() {
    let Pipeline { mut graph, source, digest, ring, log } = pipeline(1, Mode::DeferOnce);
    graph.enqueue_batch(batch(4, 3), source, 0);
    graph.flush_tasks();

    assert_eq!(graph.scan_offloadable_elements(), 0);
    assert_eq!(graph.stats().tasks_deferred, 1);
    assert_eq!(graph.open_tasks(), 1);
    // Preprocessing already happened and is not repeated
    assert!(!graph.check_preproc(digest, 0));

    assert_eq!(graph.scan_offloadable_elements(), 1);
    assert_eq!(log.lock().unwrap().preprocessed.len(), 1);
    ring.post(0, 1);
    pump(&mut graph);
    assert_eq!(log.lock().unwrap().sunk, vec![4]);
}

#[test]
fn test_refused_dispatch_drops_batches() {
    let Pipeline { mut graph, source, digest, log, .. } = pipeline(1, Mode::Refuse);
    graph.enqueue_batch(batch(5, 4), source, 0);
    graph.flush_tasks();
    assert_eq!(graph.scan_offloadable_elements(), 0);

    let stats = graph.stats();
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.packets_freed, 4);
    assert_eq!(stats.live_batches(), 0);
    assert!(graph.is_idle());
    assert!(!graph.check_postproc(digest, 0));
    assert!(log.lock().unwrap().sunk.is_empty());
}

#[test]
fn test_failed_device_drops_task() {
    let Pipeline { mut graph, source, ring, log, .. } = pipeline(2, Mode::PerSlot);
    graph.enqueue_batch(batch(1, 2), source, 0);
    graph.enqueue_batch(batch(2, 2), source, 0);
    graph.flush_tasks();
    graph.scan_offloadable_elements();

    ring.post(0, 1);
    ring.mark_failed();
    pump(&mut graph);

    let stats = graph.stats();
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.tasks_released, 0);
    assert_eq!(stats.packets_freed, 4);
    assert_eq!(stats.live_batches(), 0);
    assert!(graph.is_idle());
    assert!(graph.offload_state().is_empty());
    assert!(log.lock().unwrap().sunk.is_empty());
}

#[test]
fn test_second_task_after_finalize() {
    let Pipeline { mut graph, source, digest, ring, log } = pipeline(1, Mode::PerSlot);
    graph.enqueue_batch(batch(1, 1), source, 0);
    graph.flush_tasks();
    graph.scan_offloadable_elements();
    ring.post(0, 1);
    pump(&mut graph);
    assert!(graph.offload_state().is_finalized(digest));

    graph.enqueue_batch(batch(2, 1), source, 0);
    graph.flush_tasks();
    graph.scan_offloadable_elements();
    // Slot ids keep counting per element
    assert!(!graph.check_postproc(digest, 1));
    ring.post(0, 2);
    pump(&mut graph);

    let log = log.lock().unwrap();
    assert_eq!(log.finalized, vec![1, 2]);
    assert_eq!(log.sunk, vec![1, 2]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Slots complete in any order; the task leaves only after the last one
    /// and its batches keep their aggregation order
    #[test]
    fn prop_any_completion_order(
        order in (1usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
    ) {
        let n = order.len();
        let Pipeline { mut graph, source, digest, ring, log } = pipeline(n, Mode::PerSlot);
        for tag in 0..n {
            graph.enqueue_batch(batch(tag as u8, 3), source, 0);
        }
        graph.flush_tasks();
        prop_assert_eq!(graph.scan_offloadable_elements(), 1);

        for (done, &slot) in order.iter().enumerate() {
            prop_assert!(!graph.check_postproc_all(digest));
            ring.post(slot, 1);
            pump(&mut graph);
            let postprocessed = log.lock().unwrap().postprocessed.clone();
            prop_assert_eq!(postprocessed.len(), done + 1);
            prop_assert_eq!(postprocessed[done], slot);
            if done + 1 < n {
                prop_assert!(log.lock().unwrap().sunk.is_empty());
            }
        }

        prop_assert!(graph.check_postproc_all(digest));
        prop_assert_eq!(log.lock().unwrap().sunk.clone(), (0..n as u8).collect::<Vec<_>>());
        prop_assert_eq!(graph.stats().live_batches(), 0);
        prop_assert!(graph.is_idle());
    }
}
