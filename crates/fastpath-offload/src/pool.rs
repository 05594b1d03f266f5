//! Device worker pool
//!
//! The master splits each task into contiguous slices, one per live worker,
//! and runs as many rounds as it takes when the task is larger than
//! `live_workers * max_num_packets`. Results come back in input order.
//!
//! A worker leaves only after closing its `data_ready` barrier, and closing
//! fails while a signal is pending. Once closed, `signal()` is refused, so
//! the master can never hand work to a worker that has already gone.
//!
//! A worker that misses its deadline poisons the pool: its late completion
//! would otherwise be taken for the next task's.

use crate::barrier::{Barrier, WaitResult};
use crate::buffer::BufArray;
use crate::error::{OffloadError, OffloadResult};
use crate::worker::{
    pin_current_thread, Assignment, Kernel, KernelScratch, WorkContext, Worker, WorkerStatsSnapshot, WorkerThreadInfo,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub device_id: u32,
    pub pipeline_depth: usize,
    pub ht_per_core: usize,
    pub cores: Vec<usize>,
    pub max_packets_per_worker: u32,
    pub pin_threads: bool,
}

impl PoolConfig {
    pub fn num_worker_threads(&self) -> usize {
        self.cores.len() * self.ht_per_core
    }
}

struct PoolShared {
    workers: Vec<Worker>,
    bufs: BufArray,
    exit: AtomicBool,
    poisoned: AtomicBool,
}

/// Worker threads of one device
pub struct WorkerPool {
    device_id: u32,
    shared: Arc<PoolShared>,
    thread_info_array: Vec<WorkerThreadInfo>,
    data_ready_barriers: Vec<Arc<Barrier>>,
    task_done_barriers: Vec<Arc<Barrier>>,
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("device_id", &self.device_id)
            .field("num_worker_threads", &self.num_worker_threads())
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `cores.len() * ht_per_core` workers.
    ///
    /// Worker `i` runs on `cores[i / ht_per_core]` when pinning is on.
    pub fn spawn(config: &PoolConfig, kernel: Arc<dyn Kernel>) -> OffloadResult<Self> {
        let n = config.num_worker_threads();
        if n == 0 || config.pipeline_depth == 0 || config.max_packets_per_worker == 0 {
            return Err(OffloadError::InvalidConfig(format!(
                "pool needs workers, slots and capacity (workers {n}, depth {}, max packets {})",
                config.pipeline_depth, config.max_packets_per_worker
            )));
        }

        let data_ready_barriers: Vec<_> = (0..n).map(|_| Arc::new(Barrier::new("data_ready"))).collect();
        let task_done_barriers: Vec<_> = (0..n).map(|_| Arc::new(Barrier::new("task_done"))).collect();
        let workers = (0..n)
            .map(|i| {
                Worker::new(
                    i,
                    config.max_packets_per_worker,
                    data_ready_barriers[i].clone(),
                    task_done_barriers[i].clone(),
                )
            })
            .collect();
        let shared = Arc::new(PoolShared {
            workers,
            bufs: BufArray::new(config.pipeline_depth, n),
            exit: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        });

        let thread_info_array: Vec<_> = (0..n)
            .map(|i| WorkerThreadInfo {
                thread_id: i,
                core: config.pin_threads.then(|| config.cores[i / config.ht_per_core]),
                kernel: kernel.clone(),
            })
            .collect();

        let mut pool = Self {
            device_id: config.device_id,
            shared,
            thread_info_array,
            data_ready_barriers,
            task_done_barriers,
            threads: Mutex::new(Vec::with_capacity(n)),
        };

        for info in pool.thread_info_array.clone() {
            let shared = pool.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("vdev{}-worker-{}", config.device_id, info.thread_id))
                .spawn(move || worker_loop(shared, info));
            match spawned {
                Ok(handle) => pool.threads.get_mut().push(Some(handle)),
                Err(e) => {
                    pool.shutdown();
                    return Err(OffloadError::SpawnFailed(e.to_string()));
                }
            }
        }

        tracing::info!(
            device = config.device_id,
            workers = n,
            kernel = kernel.name(),
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn num_worker_threads(&self) -> usize {
        self.thread_info_array.len()
    }

    pub fn pipeline_depth(&self) -> usize {
        self.shared.bufs.depth()
    }

    pub fn thread_info(&self) -> &[WorkerThreadInfo] {
        &self.thread_info_array
    }

    pub fn data_ready_barriers(&self) -> &[Arc<Barrier>] {
        &self.data_ready_barriers
    }

    pub fn task_done_barriers(&self) -> &[Arc<Barrier>] {
        &self.task_done_barriers
    }

    /// Workers that have not been asked to exit
    pub fn live_workers(&self) -> usize {
        self.shared.workers.iter().filter(|w| !w.exit_requested()).count()
    }

    /// A worker stalled; every later `execute` fails
    pub fn is_poisoned(&self) -> bool {
        self.shared.poisoned.load(Ordering::Acquire)
    }

    pub fn worker_stats(&self, thread_id: usize) -> Option<WorkerStatsSnapshot> {
        self.shared.workers.get(thread_id).map(|w| w.stats().snapshot())
    }

    /// Run `packets` through the kernel on every live worker.
    ///
    /// Blocks until each released worker signals `task_done`; a worker that
    /// stays silent past `timeout` fails the call.
    pub fn execute(&self, task_id: u64, slot: usize, packets: Vec<Bytes>, timeout: Duration) -> OffloadResult<Vec<Bytes>> {
        if self.is_poisoned() {
            return Err(OffloadError::DeviceFailed(self.device_id));
        }
        if slot >= self.pipeline_depth() {
            return Err(OffloadError::Protocol(format!("slot {slot} beyond pipeline depth {}", self.pipeline_depth())));
        }
        let total = self.shared.bufs.stage(slot, packets);
        let mut results = Vec::with_capacity(total);
        let mut offset = 0;

        while offset < total {
            let live: Vec<&Worker> = self.shared.workers.iter().filter(|w| !w.exit_requested()).collect();
            if live.is_empty() {
                self.shared.bufs.clear(slot);
                return Err(OffloadError::DeviceFailed(self.device_id));
            }

            let remaining = total - offset;
            let share = remaining.div_ceil(live.len());
            let mut released = Vec::with_capacity(live.len());
            for worker in live {
                if offset >= total {
                    break;
                }
                let n = share.min(worker.max_num_packets()).min(total - offset);
                worker.assign(Assignment { task_id, slot, offset, num_packets: n });
                if worker.data_ready().signal().is_err() {
                    tracing::debug!(device = self.device_id, worker = worker.thread_id(), "skipping retired worker");
                    continue;
                }
                released.push(worker.thread_id());
                offset += n;
            }

            let deadline = Instant::now() + timeout;
            for &worker in &released {
                if let Err(e) = self.await_done(worker, task_id, deadline) {
                    self.shared.poisoned.store(true, Ordering::Release);
                    return Err(e);
                }
            }
            results.append(&mut self.shared.bufs.gather(slot, released.iter().copied()));
        }

        self.shared.bufs.clear(slot);
        Ok(results)
    }

    fn await_done(&self, worker: usize, task_id: u64, deadline: Instant) -> OffloadResult<()> {
        let barrier = &self.task_done_barriers[worker];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match barrier.wait_timeout(left) {
                WaitResult::Signaled => return Ok(()),
                WaitResult::Interrupted => continue,
                WaitResult::TimedOut => {
                    tracing::error!(device = self.device_id, worker, task_id, "worker missed task deadline");
                    return Err(OffloadError::WorkerStalled { worker, task_id });
                }
            }
        }
    }

    /// Take one worker out of service and join it.
    ///
    /// Later tasks are split over the remaining workers.
    pub fn retire_worker(&self, thread_id: usize) -> bool {
        let Some(worker) = self.shared.workers.get(thread_id) else {
            return false;
        };
        worker.request_exit();
        worker.data_ready().interrupt();
        let handle = self.threads.lock().get_mut(thread_id).and_then(Option::take);
        match handle {
            Some(handle) => {
                let _ = handle.join();
                tracing::info!(device = self.device_id, worker = thread_id, "worker retired");
                true
            }
            None => false,
        }
    }

    /// Stop and join every worker
    pub fn shutdown(&self) {
        self.shared.exit.store(true, Ordering::Release);
        for worker in &self.shared.workers {
            worker.request_exit();
            worker.data_ready().interrupt();
        }
        let handles: Vec<_> = self.threads.lock().iter_mut().filter_map(Option::take).collect();
        let joined = handles.len();
        for handle in handles {
            let _ = handle.join();
        }
        if joined > 0 {
            tracing::info!(device = self.device_id, joined, "worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>, info: WorkerThreadInfo) {
    if let Some(core) = info.core {
        pin_current_thread(core, "worker");
    }
    let worker = &shared.workers[info.thread_id];
    let mut scratch: KernelScratch = info.kernel.init_worker(info.thread_id);
    let mut output = Vec::new();

    loop {
        if (worker.exit_requested() || shared.exit.load(Ordering::Acquire)) && worker.data_ready().close() {
            break;
        }
        match worker.data_ready().wait() {
            WaitResult::Signaled => {}
            WaitResult::Interrupted | WaitResult::TimedOut => continue,
        }

        let work = worker.assignment();
        {
            let input = shared.bufs.input(work.slot);
            let end = (work.offset + work.num_packets).min(input.len());
            let slice = &input[work.offset.min(end)..end];
            let mut ctx = WorkContext {
                thread_id: info.thread_id,
                task_id: work.task_id,
                slot: work.slot,
                input: slice,
                output: &mut output,
                scratch: &mut scratch,
            };
            info.kernel.process(&mut ctx);
            let bytes: usize = slice.iter().map(Bytes::len).sum();
            worker.stats().record(slice.len() as u64, bytes as u64);
        }
        shared.bufs.result(work.slot, info.thread_id).append(&mut output);

        // The master only waits for workers it released, so a refused
        // signal means the pool is gone and nobody is listening.
        let _ = worker.task_done().signal();
    }
    tracing::debug!(worker = info.thread_id, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::EchoKernel;

    fn config(cores: usize, ht: usize, max: u32) -> PoolConfig {
        PoolConfig {
            device_id: 0,
            pipeline_depth: 2,
            ht_per_core: ht,
            cores: (0..cores).collect(),
            max_packets_per_worker: max,
            pin_threads: false,
        }
    }

    fn packets(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from((i as u32).to_le_bytes().to_vec())).collect()
    }

    #[test]
    fn test_pool_shape() {
        let pool = WorkerPool::spawn(&config(2, 2, 8), Arc::new(EchoKernel)).unwrap();
        assert_eq!(pool.num_worker_threads(), 4);
        assert_eq!(pool.thread_info().len(), 4);
        assert_eq!(pool.data_ready_barriers().len(), 4);
        assert_eq!(pool.task_done_barriers().len(), 4);
        assert_eq!(pool.live_workers(), 4);
    }

    #[test]
    fn test_execute_preserves_order_across_rounds() {
        // 3 workers x 4 packets per round, 30 packets needs 3 rounds
        let pool = WorkerPool::spawn(&config(3, 1, 4), Arc::new(EchoKernel)).unwrap();
        let input = packets(30);
        let out = pool.execute(1, 0, input.clone(), Duration::from_secs(5)).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_execute_empty_task() {
        let pool = WorkerPool::spawn(&config(1, 1, 4), Arc::new(EchoKernel)).unwrap();
        let out = pool.execute(1, 1, Vec::new(), Duration::from_secs(1)).unwrap();
        assert!(out.is_empty());
        for b in pool.data_ready_barriers() {
            assert_eq!(b.generation(), 0);
        }
    }

    #[test]
    fn test_bad_slot_is_rejected() {
        let pool = WorkerPool::spawn(&config(1, 1, 4), Arc::new(EchoKernel)).unwrap();
        let err = pool.execute(1, 5, packets(1), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, OffloadError::Protocol(_)));
    }

    #[test]
    fn test_retire_then_execute() {
        let pool = WorkerPool::spawn(&config(4, 1, 64), Arc::new(EchoKernel)).unwrap();
        assert!(pool.retire_worker(1));
        assert!(!pool.retire_worker(1));
        assert!(pool.data_ready_barriers()[1].is_closed());
        assert_eq!(pool.live_workers(), 3);

        let input = packets(50);
        let out = pool.execute(7, 0, input.clone(), Duration::from_secs(5)).unwrap();
        assert_eq!(out, input);
        assert_eq!(pool.worker_stats(1).unwrap().tasks, 0);
    }

    #[test]
    fn test_all_retired_fails() {
        let pool = WorkerPool::spawn(&config(1, 1, 8), Arc::new(EchoKernel)).unwrap();
        pool.retire_worker(0);
        let err = pool.execute(1, 0, packets(3), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, OffloadError::DeviceFailed(0)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = WorkerPool::spawn(&config(0, 1, 8), Arc::new(EchoKernel)).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidConfig(_)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::spawn(&config(2, 1, 8), Arc::new(EchoKernel)).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.data_ready_barriers().iter().all(|b| b.is_closed()));
    }
}
