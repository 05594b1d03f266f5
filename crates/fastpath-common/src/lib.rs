//! Fastpath Common - shared types for the packet engine
//!
//! This crate provides the pieces every other fastpath crate leans on:
//! - Engine configuration (JSON, serde)
//! - Configuration error type
//! - Monotonic timestamps and lock-free counters
//! - Online mean/variance accumulation for timing statistics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod stats;

pub use config::*;
pub use error::*;
pub use stats::RunningStats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic nanosecond timestamp, relative to the first timestamp taken
/// by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Get current timestamp
    #[inline(always)]
    pub fn now() -> Self {
        Self(epoch().elapsed().as_nanos() as u64)
    }

    /// Build from a raw nanosecond value
    #[inline(always)]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get nanoseconds value
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Microseconds between `earlier` and this timestamp (saturating)
    #[inline(always)]
    pub fn micros_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0) / 1000
    }

    /// Duration since this timestamp in microseconds
    #[inline(always)]
    pub fn elapsed_micros(&self) -> u64 {
        Self::now().micros_since(*self)
    }
}

/// Lock-free counter for statistics shared across threads
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
