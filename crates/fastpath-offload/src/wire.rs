//! Channel wire format
//!
//! Both endpoints of a device carry length-prefixed frames:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┐
//! │ len: u32 BE  │ payload (len bytes)         │
//! └──────────────┴─────────────────────────────┘
//! ```
//!
//! The control endpoint carries one [`ControlMessage`] per frame. The data
//! endpoint carries packet vectors: `count: u32` followed by `count`
//! length-prefixed packet payloads.

use crate::error::{OffloadError, OffloadResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const TAG_HELLO: u8 = 1;
const TAG_PORTS: u8 = 2;
const TAG_TASK: u8 = 3;
const TAG_DONE: u8 = 4;
const TAG_SHUTDOWN: u8 = 5;
const TAG_FAILED: u8 = 6;

/// Control endpoint message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Host → device on the master port: session parameters
    Hello {
        pipeline_depth: u32,
        ht_per_core: u32,
        poll_ring_len: u32,
    },
    /// Device → host on the master port: where to open data/control,
    /// and the session parameters the device settled on
    Ports {
        data_port: u16,
        ctrl_port: u16,
        remote_window: u64,
        pipeline_depth: u32,
        ht_per_core: u32,
    },
    /// Host → device: a task's packets follow on the data endpoint
    Task {
        task_id: u64,
        slot: u32,
        seq: u64,
        num_packets: u32,
    },
    /// Device → host: results follow on the data endpoint, then post `seq`
    Done {
        task_id: u64,
        slot: u32,
        seq: u64,
        num_results: u32,
    },
    /// Host → device: stop after the current task
    Shutdown,
    /// Device → host: the device gave up while running `task_id`
    Failed { task_id: u64 },
}

impl ControlMessage {
    /// Serialize into a frame payload
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            ControlMessage::Hello { pipeline_depth, ht_per_core, poll_ring_len } => {
                buf.put_u8(TAG_HELLO);
                buf.put_u32(pipeline_depth);
                buf.put_u32(ht_per_core);
                buf.put_u32(poll_ring_len);
            }
            ControlMessage::Ports { data_port, ctrl_port, remote_window, pipeline_depth, ht_per_core } => {
                buf.put_u8(TAG_PORTS);
                buf.put_u16(data_port);
                buf.put_u16(ctrl_port);
                buf.put_u64(remote_window);
                buf.put_u32(pipeline_depth);
                buf.put_u32(ht_per_core);
            }
            ControlMessage::Task { task_id, slot, seq, num_packets } => {
                buf.put_u8(TAG_TASK);
                buf.put_u64(task_id);
                buf.put_u32(slot);
                buf.put_u64(seq);
                buf.put_u32(num_packets);
            }
            ControlMessage::Done { task_id, slot, seq, num_results } => {
                buf.put_u8(TAG_DONE);
                buf.put_u64(task_id);
                buf.put_u32(slot);
                buf.put_u64(seq);
                buf.put_u32(num_results);
            }
            ControlMessage::Shutdown => buf.put_u8(TAG_SHUTDOWN),
            ControlMessage::Failed { task_id } => {
                buf.put_u8(TAG_FAILED);
                buf.put_u64(task_id);
            }
        }
    }

    /// Parse a frame payload
    pub fn decode(mut buf: Bytes) -> OffloadResult<Self> {
        let tag = take_u8(&mut buf)?;
        let needed = match tag {
            TAG_HELLO => 12,
            TAG_PORTS => 20,
            TAG_TASK | TAG_DONE => 24,
            TAG_SHUTDOWN => 0,
            TAG_FAILED => 8,
            other => return Err(OffloadError::Protocol(format!("unknown control tag {other}"))),
        };
        if buf.remaining() != needed {
            return Err(OffloadError::Protocol(format!(
                "control tag {tag}: expected {needed} bytes, got {}",
                buf.remaining()
            )));
        }

        let msg = match tag {
            TAG_HELLO => ControlMessage::Hello {
                pipeline_depth: buf.get_u32(),
                ht_per_core: buf.get_u32(),
                poll_ring_len: buf.get_u32(),
            },
            TAG_PORTS => ControlMessage::Ports {
                data_port: buf.get_u16(),
                ctrl_port: buf.get_u16(),
                remote_window: buf.get_u64(),
                pipeline_depth: buf.get_u32(),
                ht_per_core: buf.get_u32(),
            },
            TAG_TASK => ControlMessage::Task {
                task_id: buf.get_u64(),
                slot: buf.get_u32(),
                seq: buf.get_u64(),
                num_packets: buf.get_u32(),
            },
            TAG_DONE => ControlMessage::Done {
                task_id: buf.get_u64(),
                slot: buf.get_u32(),
                seq: buf.get_u64(),
                num_results: buf.get_u32(),
            },
            TAG_SHUTDOWN => ControlMessage::Shutdown,
            _ => ControlMessage::Failed { task_id: buf.get_u64() },
        };
        Ok(msg)
    }
}

/// Serialize a packet vector for the data endpoint
pub fn encode_packets(packets: &[Bytes], buf: &mut BytesMut) {
    let total: usize = packets.iter().map(|p| 4 + p.len()).sum();
    buf.reserve(4 + total);
    buf.put_u32(packets.len() as u32);
    for pkt in packets {
        buf.put_u32(pkt.len() as u32);
        buf.put_slice(pkt);
    }
}

/// Parse a data endpoint frame into packets (zero-copy slices of `buf`)
pub fn decode_packets(mut buf: Bytes) -> OffloadResult<Vec<Bytes>> {
    let count = take_u32(&mut buf)? as usize;
    let mut packets = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let len = take_u32(&mut buf)? as usize;
        if buf.remaining() < len {
            return Err(OffloadError::Protocol("truncated packet payload".into()));
        }
        packets.push(buf.split_to(len));
    }
    if buf.has_remaining() {
        return Err(OffloadError::Protocol("trailing bytes after packets".into()));
    }
    Ok(packets)
}

fn take_u8(buf: &mut Bytes) -> OffloadResult<u8> {
    if buf.remaining() < 1 {
        return Err(OffloadError::Protocol("empty frame".into()));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut Bytes) -> OffloadResult<u32> {
    if buf.remaining() < 4 {
        return Err(OffloadError::Protocol("truncated length field".into()));
    }
    Ok(buf.get_u32())
}

/// One side of a framed byte-stream channel
#[derive(Debug)]
pub struct Endpoint {
    stream: TcpStream,
    scratch: BytesMut,
}

impl Endpoint {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream) -> OffloadResult<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            scratch: BytesMut::with_capacity(4096),
        })
    }

    /// Independent handle on the same connection (for a reader thread)
    pub fn try_clone(&self) -> OffloadResult<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            scratch: BytesMut::with_capacity(4096),
        })
    }

    /// Write one frame
    pub fn send_frame(&mut self, payload: &[u8]) -> OffloadResult<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(OffloadError::Protocol(format!("frame of {} bytes too large", payload.len())));
        }
        self.stream.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    /// Read one frame; `None` on clean end-of-stream
    pub fn recv_frame(&mut self) -> OffloadResult<Option<Bytes>> {
        let mut header = [0u8; 4];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(OffloadError::Protocol(format!("peer announced {len}-byte frame")));
        }
        self.scratch.clear();
        self.scratch.resize(len, 0);
        self.stream.read_exact(&mut self.scratch)?;
        Ok(Some(self.scratch.split().freeze()))
    }

    /// Send a control message
    pub fn send_control(&mut self, msg: &ControlMessage) -> OffloadResult<()> {
        let mut buf = BytesMut::with_capacity(32);
        msg.encode(&mut buf);
        self.send_frame(&buf)
    }

    /// Receive a control message; `None` on clean end-of-stream
    pub fn recv_control(&mut self) -> OffloadResult<Option<ControlMessage>> {
        match self.recv_frame()? {
            Some(frame) => ControlMessage::decode(frame).map(Some),
            None => Ok(None),
        }
    }

    /// Send a packet vector
    pub fn send_packets(&mut self, packets: &[Bytes]) -> OffloadResult<()> {
        let mut buf = BytesMut::new();
        encode_packets(packets, &mut buf);
        self.send_frame(&buf)
    }

    /// Receive a packet vector; end-of-stream here is a protocol error
    pub fn recv_packets(&mut self) -> OffloadResult<Vec<Bytes>> {
        match self.recv_frame()? {
            Some(frame) => decode_packets(frame),
            None => Err(OffloadError::Protocol("data endpoint closed mid-task".into())),
        }
    }

    /// Close both directions
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Local port of the connection
    pub fn local_port(&self) -> OffloadResult<u16> {
        Ok(self.stream.local_addr()?.port())
    }
}
