//! Offload layer errors

use thiserror::Error;

/// Errors raised by device channels, rendezvous and the worker pool
#[derive(Debug, Error)]
pub enum OffloadError {
    /// Socket or thread I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rendezvous did not complete
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Peer sent something we did not expect
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Every pipeline slot is in flight
    #[error("no free pipeline slot on device {0}")]
    NoFreeSlot(u32),

    /// Results requested before completion was posted
    #[error("slot {slot} not ready (seq {seq})")]
    SlotNotReady { slot: usize, seq: u64 },

    /// A worker did not signal task-done in time
    #[error("worker {worker} stalled on task {task_id}")]
    WorkerStalled { worker: usize, task_id: u64 },

    /// Thread creation failed
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(String),

    /// The device is no longer usable
    #[error("device {0} failed")]
    DeviceFailed(u32),

    /// Device configuration rejected
    #[error("invalid device config: {0}")]
    InvalidConfig(String),
}

/// Result type for the offload layer
pub type OffloadResult<T> = Result<T, OffloadError>;
