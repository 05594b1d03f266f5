//! Host side of a device channel
//!
//! `submit` writes a task into a free pipeline slot and hands back a
//! [`CompletionTicket`]. A receiver thread reads `Done` messages, parks the
//! results in the slot and then posts the slot's sequence number to the
//! poll ring, so a ticket that reads ready always finds its results.

use crate::error::{OffloadError, OffloadResult};
use crate::poll_ring::{CompletionTicket, PollRing};
use crate::rendezvous::{self, SessionParams, HANDSHAKE_TIMEOUT};
use crate::wire::{ControlMessage, Endpoint};
use bytes::Bytes;
use fastpath_common::VDeviceConfig;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type ResultSlots = Arc<[Mutex<Option<Vec<Bytes>>>]>;

/// Link shared between the elements that offload to one device
pub type SharedLink = Arc<Mutex<DeviceLink>>;

/// Connected host endpoint of one device
#[derive(Debug)]
pub struct DeviceLink {
    device_id: u32,
    params: SessionParams,
    ctrl: Endpoint,
    data: Endpoint,
    ring: Arc<PollRing>,
    results: ResultSlots,
    in_flight: Vec<Option<u64>>,
    next_seq: Vec<u64>,
    next_task_id: u64,
    closing: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl DeviceLink {
    /// Rendezvous with the device at `addr` and start the receiver
    pub fn connect(addr: SocketAddr, config: &VDeviceConfig) -> OffloadResult<Self> {
        config.validate().map_err(|e| OffloadError::InvalidConfig(e.to_string()))?;
        let wanted = SessionParams {
            pipeline_depth: config.pipeline_depth,
            ht_per_core: config.ht_per_core as u32,
            poll_ring_len: config.poll_ring_len as u32,
        };
        let session = rendezvous::connect(addr, wanted, HANDSHAKE_TIMEOUT)?;
        let depth = session.params.pipeline_depth as usize;
        let ring = Arc::new(PollRing::new(config.poll_ring_len, session.remote_window));
        let results: ResultSlots = (0..depth).map(|_| Mutex::new(None)).collect();
        let closing = Arc::new(AtomicBool::new(false));

        let receiver = {
            let ctrl = session.ctrl.try_clone()?;
            let data = session.data.try_clone()?;
            let ring = ring.clone();
            let results = results.clone();
            let closing = closing.clone();
            let device_id = config.device_id;
            thread::Builder::new()
                .name(format!("vdev{device_id}-rx"))
                .spawn(move || receive_loop(device_id, ctrl, data, ring, results, closing))
                .map_err(|e| OffloadError::SpawnFailed(e.to_string()))?
        };

        tracing::info!(device = config.device_id, %addr, pipeline_depth = depth, "device link up");
        Ok(Self {
            device_id: config.device_id,
            params: session.params,
            ctrl: session.ctrl,
            data: session.data,
            ring,
            results,
            in_flight: vec![None; depth],
            next_seq: vec![0; depth],
            next_task_id: 1,
            closing,
            receiver: Some(receiver),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn params(&self) -> SessionParams {
        self.params
    }

    pub fn ring(&self) -> &Arc<PollRing> {
        &self.ring
    }

    pub fn is_failed(&self) -> bool {
        self.ring.is_failed()
    }

    /// Slots not holding an in-flight task
    pub fn free_slots(&self) -> usize {
        self.in_flight.iter().filter(|s| s.is_none()).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len() - self.free_slots()
    }

    /// Send one task. Fails with `NoFreeSlot` while the pipeline is full.
    pub fn submit(&mut self, packets: &[Bytes]) -> OffloadResult<CompletionTicket> {
        if self.ring.is_failed() {
            return Err(OffloadError::DeviceFailed(self.device_id));
        }
        let slot = self
            .in_flight
            .iter()
            .position(Option::is_none)
            .ok_or(OffloadError::NoFreeSlot(self.device_id))?;

        let seq = self.next_seq[slot] + 1;
        let task_id = self.next_task_id;
        let sent = self
            .ctrl
            .send_control(&ControlMessage::Task {
                task_id,
                slot: slot as u32,
                seq,
                num_packets: packets.len() as u32,
            })
            .and_then(|()| self.data.send_packets(packets));
        if let Err(e) = sent {
            self.ring.mark_failed();
            return Err(e);
        }

        self.next_seq[slot] = seq;
        self.next_task_id += 1;
        self.in_flight[slot] = Some(task_id);
        tracing::debug!(device = self.device_id, task_id, slot, packets = packets.len(), "task submitted");
        Ok(CompletionTicket::new(self.ring.clone(), slot, seq, task_id))
    }

    /// Non-blocking completion check
    pub fn poll(&self, ticket: &CompletionTicket) -> bool {
        ticket.is_ready()
    }

    /// Take the results of a completed task and free its slot
    pub fn collect(&mut self, ticket: &CompletionTicket) -> OffloadResult<Vec<Bytes>> {
        if !ticket.is_ready() {
            if ticket.is_failed() {
                return Err(OffloadError::DeviceFailed(self.device_id));
            }
            return Err(OffloadError::SlotNotReady { slot: ticket.slot(), seq: ticket.seq() });
        }
        let results = self.results[ticket.slot()]
            .lock()
            .take()
            .ok_or_else(|| OffloadError::Protocol(format!("slot {} posted without results", ticket.slot())))?;
        self.in_flight[ticket.slot()] = None;
        Ok(results)
    }

    /// Free the slot of a task whose results will never be read
    pub fn release(&mut self, ticket: &CompletionTicket) {
        self.results[ticket.slot()].lock().take();
        self.in_flight[ticket.slot()] = None;
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.ctrl.send_control(&ControlMessage::Shutdown);
        self.ctrl.shutdown();
        self.data.shutdown();
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        tracing::info!(device = self.device_id, "device link down");
    }
}

fn receive_loop(
    device_id: u32,
    mut ctrl: Endpoint,
    mut data: Endpoint,
    ring: Arc<PollRing>,
    results: ResultSlots,
    closing: Arc<AtomicBool>,
) {
    let reason = loop {
        match ctrl.recv_control() {
            Ok(Some(ControlMessage::Done { task_id, slot, seq, num_results })) => {
                let slot = slot as usize;
                if slot >= results.len() {
                    break format!("completion for slot {slot} beyond pipeline depth");
                }
                match data.recv_packets() {
                    Ok(packets) if packets.len() == num_results as usize => {
                        *results[slot].lock() = Some(packets);
                        ring.post(slot, seq);
                        tracing::trace!(device = device_id, task_id, slot, seq, "completion posted");
                    }
                    Ok(packets) => {
                        break format!("task {task_id} announced {num_results} results, carried {}", packets.len());
                    }
                    Err(e) => break e.to_string(),
                }
            }
            Ok(Some(ControlMessage::Failed { task_id })) => break format!("device gave up on task {task_id}"),
            Ok(Some(other)) => break format!("unexpected control message {other:?}"),
            Ok(None) => break "channel closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    ring.mark_failed();
    if !closing.load(Ordering::Acquire) {
        tracing::warn!(device = device_id, %reason, "device link lost");
    }
}
