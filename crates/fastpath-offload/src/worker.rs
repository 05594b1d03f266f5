//! Worker threads and the kernel interface they run
//!
//! Each worker owns a `data_ready` / `task_done` barrier pair. The master
//! writes an assignment into the worker's slot, signals `data_ready`, and
//! later waits on `task_done`. All assignment fields are written before the
//! signal, so relaxed loads on the worker side are enough.

use crate::barrier::Barrier;
use bytes::Bytes;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-worker state owned by a kernel.
///
/// Created on the worker thread, so it may hold buffers sized to that
/// worker and never crosses threads afterwards.
pub enum KernelScratch {
    /// Kernel needs nothing
    None,
    /// Kernel-defined state
    Opaque(Box<dyn Any + Send>),
}

impl KernelScratch {
    /// Borrow the kernel state as `T`
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        match self {
            KernelScratch::None => None,
            KernelScratch::Opaque(state) => state.downcast_mut::<T>(),
        }
    }
}

/// What a worker sees while running its share of a task
pub struct WorkContext<'a> {
    pub thread_id: usize,
    pub task_id: u64,
    pub slot: usize,
    /// This worker's contiguous slice of the task input
    pub input: &'a [Bytes],
    /// Results, one entry per input packet unless the kernel filters
    pub output: &'a mut Vec<Bytes>,
    pub scratch: &'a mut KernelScratch,
}

/// Computation run by device workers
pub trait Kernel: Send + Sync + 'static {
    /// Kernel name, for logs
    fn name(&self) -> &'static str;

    /// Build per-worker state on the worker thread
    fn init_worker(&self, _thread_id: usize) -> KernelScratch {
        KernelScratch::None
    }

    /// Process one slice of a task
    fn process(&self, ctx: &mut WorkContext<'_>);
}

/// Returns each packet unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoKernel;

impl Kernel for EchoKernel {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn process(&self, ctx: &mut WorkContext<'_>) {
        ctx.output.extend(ctx.input.iter().cloned());
    }
}

/// Per-worker counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub tasks: AtomicU64,
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl WorkerStats {
    #[inline(always)]
    pub fn record(&self, packets: u64, bytes: u64) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            tasks: self.tasks.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub tasks: u64,
    pub packets: u64,
    pub bytes: u64,
}

/// Shared per-worker work descriptor (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug)]
pub struct Worker {
    thread_id: usize,
    max_num_packets: u32,
    num_packets: AtomicU32,
    offset: AtomicU32,
    slot: AtomicUsize,
    task_id: AtomicU64,
    exit: AtomicBool,
    data_ready: Arc<Barrier>,
    task_done: Arc<Barrier>,
    stats: WorkerStats,
}

/// One worker's share of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: u64,
    pub slot: usize,
    pub offset: usize,
    pub num_packets: usize,
}

impl Worker {
    pub fn new(thread_id: usize, max_num_packets: u32, data_ready: Arc<Barrier>, task_done: Arc<Barrier>) -> Self {
        Self {
            thread_id,
            max_num_packets,
            num_packets: AtomicU32::new(0),
            offset: AtomicU32::new(0),
            slot: AtomicUsize::new(0),
            task_id: AtomicU64::new(0),
            exit: AtomicBool::new(false),
            data_ready,
            task_done,
            stats: WorkerStats::default(),
        }
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Most packets this worker takes per round
    pub fn max_num_packets(&self) -> usize {
        self.max_num_packets as usize
    }

    pub fn data_ready(&self) -> &Arc<Barrier> {
        &self.data_ready
    }

    pub fn task_done(&self) -> &Arc<Barrier> {
        &self.task_done
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Master: stage an assignment. Must precede `data_ready.signal()`.
    pub fn assign(&self, work: Assignment) {
        debug_assert!(work.num_packets <= self.max_num_packets());
        self.task_id.store(work.task_id, Ordering::Relaxed);
        self.slot.store(work.slot, Ordering::Relaxed);
        self.offset.store(work.offset as u32, Ordering::Relaxed);
        self.num_packets.store(work.num_packets as u32, Ordering::Relaxed);
    }

    /// Worker: read the staged assignment after `data_ready` fired
    pub fn assignment(&self) -> Assignment {
        Assignment {
            task_id: self.task_id.load(Ordering::Relaxed),
            slot: self.slot.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed) as usize,
            num_packets: self.num_packets.load(Ordering::Relaxed) as usize,
        }
    }

    /// Ask this worker to leave its loop
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

/// Start-up parameters handed to a worker thread
#[derive(Clone)]
pub struct WorkerThreadInfo {
    pub thread_id: usize,
    /// Core to pin to, if pinning is enabled
    pub core: Option<usize>,
    pub kernel: Arc<dyn Kernel>,
}

impl std::fmt::Debug for WorkerThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThreadInfo")
            .field("thread_id", &self.thread_id)
            .field("core", &self.core)
            .field("kernel", &self.kernel.name())
            .finish()
    }
}

/// Pin the calling thread; logs and carries on if the OS refuses
pub(crate) fn pin_current_thread(core: usize, role: &str) {
    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
        tracing::debug!(core, role, "pinned thread");
    } else {
        tracing::warn!(core, role, "failed to pin thread");
    }
}
