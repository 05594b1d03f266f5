//! Pipeline slot buffers
//!
//! One input buffer per pipeline slot, written by the master before it
//! releases workers and read concurrently by those workers. Result cells are
//! indexed `[slot][worker]` so every worker writes its own cell and the
//! master concatenates them in offset order.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

/// Input and result storage for `pipeline_depth` in-flight tasks
#[derive(Debug)]
pub struct BufArray {
    inputs: Box<[RwLock<Vec<Bytes>>]>,
    results: Box<[Box<[Mutex<Vec<Bytes>>]>]>,
}

impl BufArray {
    pub fn new(pipeline_depth: usize, num_workers: usize) -> Self {
        let inputs = (0..pipeline_depth).map(|_| RwLock::new(Vec::new())).collect();
        let results = (0..pipeline_depth)
            .map(|_| (0..num_workers).map(|_| Mutex::new(Vec::new())).collect())
            .collect();
        Self { inputs, results }
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        self.inputs.len()
    }

    /// Replace the input of `slot`, returning the number of packets staged
    pub fn stage(&self, slot: usize, packets: Vec<Bytes>) -> usize {
        let mut input = self.inputs[slot].write();
        *input = packets;
        input.len()
    }

    /// Read access for workers
    pub fn input(&self, slot: usize) -> parking_lot::RwLockReadGuard<'_, Vec<Bytes>> {
        self.inputs[slot].read()
    }

    /// Drop the staged input of `slot`
    pub fn clear(&self, slot: usize) {
        self.inputs[slot].write().clear();
    }

    /// Result cell of `worker` for `slot`
    pub fn result(&self, slot: usize, worker: usize) -> parking_lot::MutexGuard<'_, Vec<Bytes>> {
        self.results[slot][worker].lock()
    }

    /// Take the results of `workers` for `slot` in the given order
    pub fn gather(&self, slot: usize, workers: impl IntoIterator<Item = usize>) -> Vec<Bytes> {
        let mut out = Vec::new();
        for worker in workers {
            out.append(&mut self.results[slot][worker].lock());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_read() {
        let bufs = BufArray::new(2, 3);
        assert_eq!(bufs.depth(), 2);
        let n = bufs.stage(1, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(n, 2);
        assert_eq!(bufs.input(1).len(), 2);
        assert!(bufs.input(0).is_empty());
        bufs.clear(1);
        assert!(bufs.input(1).is_empty());
    }

    #[test]
    fn test_gather_follows_worker_order() {
        let bufs = BufArray::new(1, 3);
        bufs.result(0, 2).push(Bytes::from_static(b"first"));
        bufs.result(0, 0).push(Bytes::from_static(b"second"));
        let out = bufs.gather(0, [2, 0, 1]);
        assert_eq!(out, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        assert!(bufs.result(0, 2).is_empty());
    }
}
