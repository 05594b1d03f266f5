//! Channel rendezvous
//!
//! ```text
//!  host                                  device
//!   │ ── connect(master_port) ──────────▶ │ accept
//!   │ ── Hello{depth, ht, ring_len} ────▶ │ negotiate, bind data + ctrl listeners
//!   │ ◀─ Ports{data, ctrl, window, ...} ─ │
//!   │ ── connect(data_port) ────────────▶ │ accept
//!   │ ── connect(ctrl_port) ────────────▶ │ accept
//! ```
//!
//! Any failure along the way is fatal to the session.

use crate::error::{OffloadError, OffloadResult};
use crate::wire::{ControlMessage, Endpoint};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long either side waits for the peer during rendezvous
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters settled during rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Tasks allowed in flight
    pub pipeline_depth: u32,
    /// Worker threads per core
    pub ht_per_core: u32,
    /// Poll ring slots on the host
    pub poll_ring_len: u32,
}

/// Established data + control endpoints
#[derive(Debug)]
pub struct Session {
    /// Negotiated parameters
    pub params: SessionParams,
    /// Offset the device posts completions at
    pub remote_window: u64,
    /// Packet payloads and results
    pub data: Endpoint,
    /// Task metadata
    pub ctrl: Endpoint,
}

/// Device-side well-known port
#[derive(Debug)]
pub struct MasterListener {
    listener: TcpListener,
}

fn listen_on(addr: SocketAddr) -> OffloadResult<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    Ok(socket.into())
}

fn accept_before(listener: &TcpListener, deadline: Instant, cancel: &AtomicBool) -> OffloadResult<TcpStream> {
    listener.set_nonblocking(true)?;
    let result = loop {
        match listener.accept() {
            Ok((stream, _)) => break Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    break Err(OffloadError::Handshake("peer never connected".into()));
                }
                if cancel.load(Ordering::Acquire) {
                    break Err(OffloadError::Handshake("cancelled".into()));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => break Err(e.into()),
        }
    };
    listener.set_nonblocking(false)?;
    let stream = result?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

impl MasterListener {
    /// Bind the master port (`port 0` picks one)
    pub fn bind(addr: &str) -> OffloadResult<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| OffloadError::Handshake(format!("unresolvable master address {addr}")))?;
        Ok(Self { listener: listen_on(addr)? })
    }

    /// Bound address
    pub fn local_addr(&self) -> OffloadResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one host and run the device half of the rendezvous.
    ///
    /// `limits` caps what the host may ask for; the smaller of each value
    /// wins and is reported back in `Ports`.
    pub fn accept_session(
        &self,
        limits: SessionParams,
        remote_window: u64,
        deadline: Instant,
        cancel: &AtomicBool,
    ) -> OffloadResult<Session> {
        let master = accept_before(&self.listener, deadline, cancel)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        master.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
        let mut master = Endpoint::new(master)?;

        let (want_depth, want_ht, ring_len) = match master.recv_control()? {
            Some(ControlMessage::Hello { pipeline_depth, ht_per_core, poll_ring_len }) => {
                (pipeline_depth, ht_per_core, poll_ring_len)
            }
            other => return Err(OffloadError::Handshake(format!("expected Hello, got {other:?}"))),
        };
        if want_depth == 0 || want_ht == 0 {
            return Err(OffloadError::Handshake("host asked for an empty pipeline".into()));
        }

        let params = SessionParams {
            pipeline_depth: want_depth.min(limits.pipeline_depth).min(ring_len),
            ht_per_core: want_ht.min(limits.ht_per_core),
            poll_ring_len: ring_len,
        };
        if params.pipeline_depth == 0 {
            return Err(OffloadError::Handshake("poll ring too short for any task".into()));
        }

        let ip = self.listener.local_addr()?.ip();
        let data_listener = listen_on(SocketAddr::new(ip, 0))?;
        let ctrl_listener = listen_on(SocketAddr::new(ip, 0))?;

        master.send_control(&ControlMessage::Ports {
            data_port: data_listener.local_addr()?.port(),
            ctrl_port: ctrl_listener.local_addr()?.port(),
            remote_window,
            pipeline_depth: params.pipeline_depth,
            ht_per_core: params.ht_per_core,
        })?;

        let data = Endpoint::new(accept_before(&data_listener, deadline, cancel)?)?;
        let ctrl = Endpoint::new(accept_before(&ctrl_listener, deadline, cancel)?)?;

        tracing::debug!(?params, "device session established");
        Ok(Session { params, remote_window, data, ctrl })
    }
}

/// Host half of the rendezvous
pub fn connect(addr: SocketAddr, wanted: SessionParams, timeout: Duration) -> OffloadResult<Session> {
    let master = TcpStream::connect_timeout(&addr, timeout)?;
    master.set_read_timeout(Some(timeout))?;
    let mut master = Endpoint::new(master)?;

    master.send_control(&ControlMessage::Hello {
        pipeline_depth: wanted.pipeline_depth,
        ht_per_core: wanted.ht_per_core,
        poll_ring_len: wanted.poll_ring_len,
    })?;

    let (data_port, ctrl_port, remote_window, params) = match master.recv_control()? {
        Some(ControlMessage::Ports { data_port, ctrl_port, remote_window, pipeline_depth, ht_per_core }) => (
            data_port,
            ctrl_port,
            remote_window,
            SessionParams { pipeline_depth, ht_per_core, poll_ring_len: wanted.poll_ring_len },
        ),
        other => return Err(OffloadError::Handshake(format!("expected Ports, got {other:?}"))),
    };

    let ip: IpAddr = addr.ip();
    let data = Endpoint::new(TcpStream::connect_timeout(&SocketAddr::new(ip, data_port), timeout)?)?;
    let ctrl = Endpoint::new(TcpStream::connect_timeout(&SocketAddr::new(ip, ctrl_port), timeout)?)?;

    tracing::debug!(%addr, ?params, "host session established");
    Ok(Session { params, remote_window, data, ctrl })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn limits() -> SessionParams {
        SessionParams { pipeline_depth: 2, ht_per_core: 4, poll_ring_len: 0 }
    }

    #[test]
    fn test_rendezvous_negotiates_smaller_values() {
        let master = MasterListener::bind("127.0.0.1:0").unwrap();
        let addr = master.local_addr().unwrap();

        let host = std::thread::spawn(move || {
            let wanted = SessionParams { pipeline_depth: 8, ht_per_core: 1, poll_ring_len: 8 };
            connect(addr, wanted, HANDSHAKE_TIMEOUT).unwrap()
        });

        let mut device = master
            .accept_session(limits(), 0x40, Instant::now() + HANDSHAKE_TIMEOUT, &AtomicBool::new(false))
            .unwrap();
        let mut host = host.join().unwrap();

        assert_eq!(device.params.pipeline_depth, 2);
        assert_eq!(device.params.ht_per_core, 1);
        assert_eq!(host.params, device.params);
        assert_eq!(host.remote_window, 0x40);

        host.data.send_packets(&[Bytes::from_static(b"x")]).unwrap();
        assert_eq!(device.data.recv_packets().unwrap().len(), 1);
        device.ctrl.send_control(&ControlMessage::Shutdown).unwrap();
        assert_eq!(host.ctrl.recv_control().unwrap(), Some(ControlMessage::Shutdown));
    }

    #[test]
    fn test_accept_times_out_without_host() {
        let master = MasterListener::bind("127.0.0.1:0").unwrap();
        let err = master
            .accept_session(limits(), 0, Instant::now() + Duration::from_millis(20), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, OffloadError::Handshake(_)));
    }

    #[test]
    fn test_bad_hello_is_rejected() {
        let master = MasterListener::bind("127.0.0.1:0").unwrap();
        let addr = master.local_addr().unwrap();
        let host = std::thread::spawn(move || {
            let mut ep = Endpoint::new(TcpStream::connect(addr).unwrap()).unwrap();
            ep.send_control(&ControlMessage::Shutdown).unwrap();
        });
        let err = master
            .accept_session(limits(), 0, Instant::now() + HANDSHAKE_TIMEOUT, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, OffloadError::Handshake(_)));
        host.join().unwrap();
    }

    #[test]
    fn test_accept_honours_cancel() {
        let master = MasterListener::bind("127.0.0.1:0").unwrap();
        let cancel = AtomicBool::new(true);
        let start = Instant::now();
        let err = master
            .accept_session(limits(), 0, Instant::now() + HANDSHAKE_TIMEOUT, &cancel)
            .unwrap_err();
        assert!(matches!(err, OffloadError::Handshake(_)));
        assert!(start.elapsed() < HANDSHAKE_TIMEOUT);
    }
}
