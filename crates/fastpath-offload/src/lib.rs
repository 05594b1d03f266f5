//! Fastpath Offload - coprocessor coordination layer
//!
//! Hands batches of packets to a pool of device-side worker threads and
//! reports completion back to the host without blocking it.
//!
//! # Architecture
//!
//! ```text
//!        host (graph thread)                       device
//!  ┌──────────────────────────┐        ┌──────────────────────────────────┐
//!  │ DeviceLink               │  ctrl  │ VDevice master                   │
//!  │   submit() ── Task ──────┼───────▶│   recv Task + packets            │
//!  │                          │  data  │   WorkerPool::execute            │
//!  │   rx thread ◀── Done ────┼────────┤     data_ready ─▶ worker 0..N    │
//!  │     PollRing::post(seq)  │        │     task_done  ◀─ worker 0..N    │
//!  │                          │        │   send Done + results            │
//!  │ CompletionTicket         │        └──────────────────────────────────┘
//!  │   is_ready() (Acquire)   │
//!  └──────────────────────────┘
//! ```
//!
//! # Hand-off guarantees
//!
//! 1. A worker only ever sees the assignment staged before its
//!    `data_ready` signal.
//! 2. A retired worker closes its barrier first, so the master cannot
//!    signal it afterwards.
//! 3. Results are written before the poll ring slot is posted.
//! 4. A master that waits past `task_timeout_ms` marks the device failed
//!    instead of blocking forever.

#![warn(clippy::all)]

pub mod barrier;
pub mod buffer;
pub mod error;
pub mod link;
pub mod manager;
pub mod poll_ring;
pub mod pool;
pub mod rendezvous;
pub mod stats;
pub mod vdevice;
pub mod wire;
pub mod worker;

pub use barrier::{Barrier, BarrierClosed, WaitResult};
pub use error::{OffloadError, OffloadResult};
pub use link::{DeviceLink, SharedLink};
pub use manager::DeviceManager;
pub use poll_ring::{CompletionTicket, PollRing};
pub use pool::{PoolConfig, WorkerPool};
pub use stats::{describe_metrics, DeviceStats, DeviceStatsSnapshot};
pub use vdevice::VDevice;
pub use worker::{EchoKernel, Kernel, KernelScratch, WorkContext, Worker, WorkerThreadInfo};
