//! Element graph scheduling benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fastpath_graph::{
    Dispatch, Element, ElementGraph, ElementId, OffloadTask, OffloadableElement, Packet, PacketBatch, Verdict,
};
use fastpath_offload::{CompletionTicket, PollRing};
use std::sync::Arc;
use std::time::Duration;

struct Hop;

impl Element for Hop {
    fn class_name(&self) -> &'static str {
        "Hop"
    }
    fn process(&mut self, _input_port: usize, batch: &mut PacketBatch) -> Verdict {
        for pkt in batch.iter_mut() {
            pkt.set_anno(0, pkt.anno(0) + 1);
        }
        Verdict::Forward(0)
    }
}

/// Completes its own tickets at dispatch time
struct SelfCompleting {
    ring: Arc<PollRing>,
}

impl Element for SelfCompleting {
    fn class_name(&self) -> &'static str {
        "SelfCompleting"
    }
    fn process(&mut self, _input_port: usize, _batch: &mut PacketBatch) -> Verdict {
        Verdict::Forward(0)
    }
    fn as_offloadable_mut(&mut self) -> Option<&mut dyn OffloadableElement> {
        Some(self)
    }
}

impl OffloadableElement for SelfCompleting {
    fn ready_to_dispatch(&self, _pending_batches: usize, _age: Duration) -> bool {
        true
    }
    fn dispatch(&mut self, task: &mut OffloadTask) -> Dispatch {
        self.ring.post(0, task.id());
        Dispatch::Whole(CompletionTicket::new(self.ring.clone(), 0, task.id(), task.id()))
    }
    fn postprocess(&mut self, _task: &OffloadTask, _index: usize, batch: &mut PacketBatch) {
        black_box(batch.len());
    }
}

fn chain(len: usize) -> (ElementGraph, ElementId) {
    let mut graph = ElementGraph::default();
    let first = graph.add_element(Hop).unwrap();
    let mut prev = first;
    for _ in 1..len {
        let next = graph.add_element(Hop).unwrap();
        graph.link_element(next, 0, prev, 0).unwrap();
        prev = next;
    }
    (graph, first)
}

fn batch() -> PacketBatch {
    PacketBatch::new(vec![Packet::from_slice(&[0u8; 64]); 32])
}

fn bench_flush_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush_chain");
    for len in [1usize, 4, 16] {
        let (mut graph, first) = chain(len);
        group.throughput(Throughput::Elements(32));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                graph.enqueue_batch(batch(), first, 0);
                black_box(graph.flush_tasks())
            })
        });
    }
    group.finish();
}

fn bench_offload_round(c: &mut Criterion) {
    let ring = Arc::new(PollRing::new(1, 0));
    let mut graph = ElementGraph::default();
    let entry = graph.add_element(Hop).unwrap();
    let offl = graph.add_element(SelfCompleting { ring }).unwrap();
    graph.link_element(offl, 0, entry, 0).unwrap();

    c.bench_function("offload_round", |b| {
        b.iter(|| {
            graph.enqueue_batch(batch(), entry, 0);
            graph.flush_tasks();
            graph.scan_offloadable_elements();
            graph.flush_offloaded_tasks();
            black_box(graph.flush_tasks())
        })
    });
}

criterion_group!(benches, bench_flush_chain, bench_offload_round);
criterion_main!(benches);
