//! Per-thread polling loop

use crate::batch::PacketBatch;
use crate::graph::ElementGraph;
use fastpath_common::DriverConfig;
use std::time::Duration;

/// Driver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub iterations: u64,
    /// Iterations that found nothing to do
    pub idle_iterations: u64,
    /// Batches pulled from schedulable elements
    pub injected_batches: u64,
}

/// One compute thread's view of its graph.
///
/// Each iteration polls every schedulable element, drains the work queue,
/// and on the configured cadence scans offloadable elements for dispatch
/// and collects device completions.
#[derive(Debug)]
pub struct ComputeContext {
    graph: ElementGraph,
    config: DriverConfig,
    stats: DriverStats,
}

impl ComputeContext {
    pub fn new(graph: ElementGraph, config: DriverConfig) -> Self {
        Self { graph, config, stats: DriverStats::default() }
    }

    pub fn graph(&self) -> &ElementGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ElementGraph {
        &mut self.graph
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn into_graph(self) -> ElementGraph {
        self.graph
    }

    /// Run one iteration; returns whether any work was done
    pub fn run_iteration(&mut self) -> bool {
        self.stats.iterations += 1;
        let iter = self.stats.iterations;
        let mut busy = false;

        for idx in 0..self.graph.get_schedulable_elements().len() {
            let id = self.graph.get_schedulable_elements()[idx];
            if let Some(packets) = self.graph.poll_schedulable(id) {
                if packets.is_empty() {
                    continue;
                }
                self.graph.enqueue_batch(PacketBatch::new(packets), id, 0);
                self.stats.injected_batches += 1;
                busy = true;
            }
        }

        busy |= self.graph.flush_tasks() > 0;

        if iter % u64::from(self.config.scan_interval.max(1)) == 0 {
            busy |= self.graph.scan_offloadable_elements() > 0;
        }
        if iter % u64::from(self.config.poll_interval.max(1)) == 0 && self.graph.flush_offloaded_tasks() > 0 {
            busy = true;
            self.graph.flush_tasks();
        }

        if !busy {
            self.stats.idle_iterations += 1;
            if self.config.idle_backoff_us > 0 {
                std::thread::sleep(Duration::from_micros(self.config.idle_backoff_us));
            }
        }
        busy
    }

    /// Iterate until `stop` returns true or `max_iterations` have run.
    /// Returns the number of iterations executed.
    pub fn run_until<F>(&mut self, mut stop: F, max_iterations: u64) -> u64
    where
        F: FnMut(&ElementGraph) -> bool,
    {
        let mut ran = 0;
        while ran < max_iterations && !stop(&self.graph) {
            self.run_iteration();
            ran += 1;
        }
        tracing::debug!(
            iterations = ran,
            idle = self.stats.idle_iterations,
            injected = self.stats.injected_batches,
            "driver loop stopped"
        );
        ran
    }
}
