//! Virtual coprocessor device
//!
//! A `VDevice` is the device half of an offload channel: a master thread
//! that accepts one host, spawns the worker pool sized by the negotiated
//! parameters, and then serves `Task` messages one at a time until the host
//! says `Shutdown`, the channel drops, or a worker stalls.

use crate::error::{OffloadError, OffloadResult};
use crate::pool::{PoolConfig, WorkerPool};
use crate::rendezvous::{MasterListener, Session, SessionParams, HANDSHAKE_TIMEOUT};
use crate::stats::{DeviceStats, DeviceStatsSnapshot};
use crate::wire::{ControlMessage, Endpoint};
use crate::worker::{pin_current_thread, Kernel};
use fastpath_common::VDeviceConfig;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Spacing of the per-device poll ring windows
pub const POLL_RING_WINDOW_STRIDE: u64 = 1 << 20;

#[derive(Debug)]
struct DeviceShared {
    exit: AtomicBool,
    failed: AtomicBool,
    stats: Mutex<DeviceStats>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    ctrl: Mutex<Option<Endpoint>>,
    data: Mutex<Option<Endpoint>>,
    params: Mutex<Option<SessionParams>>,
}

/// Handle on a running device
#[derive(Debug)]
pub struct VDevice {
    device_id: u32,
    master_addr: SocketAddr,
    shared: Arc<DeviceShared>,
    master_thread: Option<JoinHandle<()>>,
}

impl VDevice {
    /// Bind the master port and start the master thread.
    ///
    /// The host must connect within [`HANDSHAKE_TIMEOUT`].
    pub fn launch(config: &VDeviceConfig, kernel: Arc<dyn Kernel>) -> OffloadResult<Self> {
        config.validate().map_err(|e| OffloadError::InvalidConfig(e.to_string()))?;
        let listener = MasterListener::bind(&config.master_addr)?;
        let master_addr = listener.local_addr()?;

        let shared = Arc::new(DeviceShared {
            exit: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stats: Mutex::new(DeviceStats::new(config.device_id)),
            pool: Mutex::new(None),
            ctrl: Mutex::new(None),
            data: Mutex::new(None),
            params: Mutex::new(None),
        });

        let master = Master {
            device_id: config.device_id,
            config: config.clone(),
            kernel,
            shared: shared.clone(),
            cur_task_id: 0,
            next_task_id: 0,
            num_packets_in_cur_task: 0,
        };
        let master_thread = thread::Builder::new()
            .name(format!("vdev{}-master", config.device_id))
            .spawn(move || master.run(listener))
            .map_err(|e| OffloadError::SpawnFailed(e.to_string()))?;

        tracing::info!(device = config.device_id, %master_addr, "device listening");
        Ok(Self {
            device_id: config.device_id,
            master_addr,
            shared,
            master_thread: Some(master_thread),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Address hosts connect to
    pub fn master_addr(&self) -> SocketAddr {
        self.master_addr
    }

    /// The device stopped serving because of an error
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Parameters agreed with the host, once connected
    pub fn session_params(&self) -> Option<SessionParams> {
        *self.shared.params.lock()
    }

    /// Worker count, once the pool is up
    pub fn num_worker_threads(&self) -> Option<usize> {
        self.shared.pool.lock().as_ref().map(|p| p.num_worker_threads())
    }

    /// Handle on the running pool
    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.shared.pool.lock().clone()
    }

    /// Take one worker out of service
    pub fn retire_worker(&self, thread_id: usize) -> bool {
        match self.pool() {
            Some(pool) => pool.retire_worker(thread_id),
            None => false,
        }
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.shared.stats.lock().snapshot()
    }

    /// Stop the master and every worker, then join them.
    ///
    /// Both channels are closed, so a master blocked on either one wakes.
    pub fn shutdown(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        for endpoint in [&self.shared.ctrl, &self.shared.data] {
            if let Some(endpoint) = endpoint.lock().as_ref() {
                endpoint.shutdown();
            }
        }
        if let Some(handle) = self.master_thread.take() {
            if handle.join().is_err() {
                tracing::error!(device = self.device_id, "device master panicked");
            }
            tracing::info!(device = self.device_id, "device stopped");
        }
    }
}

impl Drop for VDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Master {
    device_id: u32,
    config: VDeviceConfig,
    kernel: Arc<dyn Kernel>,
    shared: Arc<DeviceShared>,
    cur_task_id: u64,
    next_task_id: u64,
    num_packets_in_cur_task: usize,
}

impl Master {
    fn run(mut self, listener: MasterListener) {
        if self.config.pin_threads {
            if let Some(&core) = self.config.cores.first() {
                pin_current_thread(core, "master");
            }
        }

        match self.serve(listener) {
            Ok(()) => tracing::debug!(device = self.device_id, "device master exiting"),
            Err(e) => {
                self.shared.failed.store(true, Ordering::Release);
                self.shared.stats.lock().record_failure();
                tracing::error!(
                    device = self.device_id,
                    task_id = self.cur_task_id,
                    error = %e,
                    "device failed"
                );
            }
        }

        if let Some(pool) = self.shared.pool.lock().take() {
            pool.shutdown();
        }
    }

    fn serve(&mut self, listener: MasterListener) -> OffloadResult<()> {
        let limits = SessionParams {
            pipeline_depth: self.config.pipeline_depth,
            ht_per_core: self.config.ht_per_core as u32,
            poll_ring_len: self.config.poll_ring_len as u32,
        };
        let window = u64::from(self.device_id) * POLL_RING_WINDOW_STRIDE;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let session = match listener.accept_session(limits, window, deadline, &self.shared.exit) {
            Ok(session) => session,
            Err(_) if self.shared.exit.load(Ordering::Acquire) => return Ok(()),
            Err(e) => return Err(e),
        };
        drop(listener);

        let pool = WorkerPool::spawn(
            &PoolConfig {
                device_id: self.device_id,
                pipeline_depth: session.params.pipeline_depth as usize,
                ht_per_core: session.params.ht_per_core as usize,
                cores: self.config.cores.clone(),
                max_packets_per_worker: self.config.max_packets_per_worker,
                pin_threads: self.config.pin_threads,
            },
            self.kernel.clone(),
        )?;
        let pool = Arc::new(pool);
        *self.shared.pool.lock() = Some(pool.clone());
        *self.shared.data.lock() = Some(session.data.try_clone()?);
        *self.shared.ctrl.lock() = Some(session.ctrl.try_clone()?);
        *self.shared.params.lock() = Some(session.params);
        if self.shared.exit.load(Ordering::Acquire) {
            return Ok(());
        }

        tracing::info!(
            device = self.device_id,
            workers = pool.num_worker_threads(),
            pipeline_depth = session.params.pipeline_depth,
            "device serving"
        );

        let Session { mut data, mut ctrl, .. } = session;
        loop {
            let msg = match ctrl.recv_control() {
                Ok(msg) => msg,
                Err(_) if self.shared.exit.load(Ordering::Acquire) => return Ok(()),
                Err(e) => return Err(e),
            };
            match msg {
                None | Some(ControlMessage::Shutdown) => return Ok(()),
                Some(ControlMessage::Task { task_id, slot, seq, num_packets }) => {
                    match self.run_task(&pool, &mut data, &mut ctrl, task_id, slot, seq, num_packets) {
                        Ok(()) => {}
                        Err(_) if self.shared.exit.load(Ordering::Acquire) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                Some(other) => {
                    return Err(OffloadError::Protocol(format!("unexpected control message {other:?}")));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task(
        &mut self,
        pool: &WorkerPool,
        data: &mut Endpoint,
        ctrl: &mut Endpoint,
        task_id: u64,
        slot: u32,
        seq: u64,
        num_packets: u32,
    ) -> OffloadResult<()> {
        self.shared.stats.lock().begin_batch();
        let recv_start = Instant::now();
        let packets = data.recv_packets()?;
        if packets.len() != num_packets as usize {
            return Err(OffloadError::Protocol(format!(
                "task {task_id} announced {num_packets} packets, carried {}",
                packets.len()
            )));
        }
        if task_id < self.next_task_id {
            return Err(OffloadError::Protocol(format!(
                "task {task_id} arrived after task {}",
                self.cur_task_id
            )));
        }
        self.cur_task_id = task_id;
        self.next_task_id = task_id + 1;
        self.num_packets_in_cur_task = packets.len();
        let recv_us = recv_start.elapsed().as_micros() as u64;

        let exec_start = Instant::now();
        let results = match pool.execute(task_id, slot as usize, packets, self.config.task_timeout()) {
            Ok(results) => results,
            Err(e) => {
                let _ = ctrl.send_control(&ControlMessage::Failed { task_id });
                return Err(e);
            }
        };
        let process_us = exec_start.elapsed().as_micros() as u64;

        let send_start = Instant::now();
        ctrl.send_control(&ControlMessage::Done {
            task_id,
            slot,
            seq,
            num_results: results.len() as u32,
        })?;
        data.send_packets(&results)?;
        let transfer_us = recv_us + send_start.elapsed().as_micros() as u64;

        self.shared
            .stats
            .lock()
            .end_batch(self.num_packets_in_cur_task as u64, process_us, transfer_us);
        tracing::debug!(
            device = self.device_id,
            task_id,
            slot,
            packets = self.num_packets_in_cur_task,
            process_us,
            "task complete"
        );
        Ok(())
    }
}
