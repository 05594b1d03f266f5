//! Device statistics
//!
//! Owned by the device master thread; readers get a copy through the
//! device handle. Every completed batch is also reported to the `metrics`
//! facade so an installed recorder can export it.

use fastpath_common::{RunningStats, Timestamp};
use metrics::{counter, histogram};

const BATCHES_PROCESSED: &str = "fastpath_device_batches_processed";
const PACKETS_PROCESSED: &str = "fastpath_device_packets_processed";
const BATCH_PROCESS_US: &str = "fastpath_device_batch_process_us";
const BATCH_TRANSFER_US: &str = "fastpath_device_batch_transfer_us";
const DEVICE_FAILURES: &str = "fastpath_device_failures";

/// Describe the device metrics; safe to call more than once
pub fn describe_metrics() {
    metrics::describe_counter!(BATCHES_PROCESSED, metrics::Unit::Count, "Offload tasks completed by a device");
    metrics::describe_counter!(PACKETS_PROCESSED, metrics::Unit::Count, "Packets completed by a device");
    metrics::describe_histogram!(BATCH_PROCESS_US, metrics::Unit::Microseconds, "Kernel time per task");
    metrics::describe_histogram!(BATCH_TRANSFER_US, metrics::Unit::Microseconds, "Channel time per task");
    metrics::describe_counter!(DEVICE_FAILURES, metrics::Unit::Count, "Devices that stopped accepting tasks");
}

/// Cumulative timing and throughput of one device
#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    device_id: u32,
    first_entry: bool,
    ts_laststat: Timestamp,
    ts_curstat: Timestamp,
    ts_batch_begin: Timestamp,
    ts_batch_end: Timestamp,
    total_packets_processed: u64,
    total_batches_processed: u64,
    process_us: RunningStats,
    transfer_us: RunningStats,
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceStatsSnapshot {
    pub total_packets_processed: u64,
    pub total_batches_processed: u64,
    pub acc_batch_process_us: u64,
    pub acc_batch_process_us_sq: u64,
    pub acc_batch_transfer_us: u64,
    pub acc_batch_transfer_us_sq: u64,
    pub mean_process_us: f64,
    pub var_process_us: f64,
    pub mean_transfer_us: f64,
    pub var_transfer_us: f64,
    /// Microseconds from the first batch to the latest one
    pub active_us: u64,
}

impl DeviceStatsSnapshot {
    pub fn packet_rate_mpps(&self) -> f64 {
        if self.active_us == 0 {
            return 0.0;
        }
        self.total_packets_processed as f64 / self.active_us as f64
    }
}

impl DeviceStats {
    pub fn new(device_id: u32) -> Self {
        Self { device_id, first_entry: true, ..Default::default() }
    }

    /// Mark the start of a batch
    pub fn begin_batch(&mut self) {
        let now = Timestamp::now();
        if self.first_entry {
            self.first_entry = false;
            self.ts_laststat = now;
        }
        self.ts_batch_begin = now;
    }

    /// Record one completed batch
    pub fn end_batch(&mut self, packets: u64, process_us: u64, transfer_us: u64) {
        self.ts_batch_end = Timestamp::now();
        self.ts_curstat = self.ts_batch_end;
        self.total_packets_processed += packets;
        self.total_batches_processed += 1;
        self.process_us.record(process_us);
        self.transfer_us.record(transfer_us);

        let device = self.device_id.to_string();
        counter!(BATCHES_PROCESSED, "device" => device.clone()).increment(1);
        counter!(PACKETS_PROCESSED, "device" => device.clone()).increment(packets);
        histogram!(BATCH_PROCESS_US, "device" => device.clone()).record(process_us as f64);
        histogram!(BATCH_TRANSFER_US, "device" => device).record(transfer_us as f64);
    }

    /// Record that the device stopped accepting tasks
    pub fn record_failure(&self) {
        counter!(DEVICE_FAILURES, "device" => self.device_id.to_string()).increment(1);
    }

    /// Microseconds the current batch has been running
    pub fn batch_elapsed_us(&self) -> u64 {
        self.ts_batch_begin.elapsed_micros()
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            total_packets_processed: self.total_packets_processed,
            total_batches_processed: self.total_batches_processed,
            acc_batch_process_us: self.process_us.sum(),
            acc_batch_process_us_sq: self.process_us.sum_sq(),
            acc_batch_transfer_us: self.transfer_us.sum(),
            acc_batch_transfer_us_sq: self.transfer_us.sum_sq(),
            mean_process_us: self.process_us.mean(),
            var_process_us: self.process_us.variance(),
            mean_transfer_us: self.transfer_us.mean(),
            var_transfer_us: self.transfer_us.variance(),
            active_us: self.ts_curstat.micros_since(self.ts_laststat),
        }
    }
}
