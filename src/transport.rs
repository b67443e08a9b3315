//! Raw-frame injection and capture on one topology endpoint.
//!
//! Each transport owns an `AF_PACKET` socket bound to its interface and a
//! background capture task that feeds a bounded queue. `send_and_wait`
//! drains stale captures, injects, then waits on the queue for a frame that
//! answers the injected packet. "No reply within the timeout" is a normal
//! result, not an error.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::packet::constants::{ETH_HDR_LEN, MTU};
use crate::packet::{PacketDescriptor, parsers};
use crate::topology::Endpoint;

/// Capture queue depth. The consumer drains before every injection, so the
/// queue only has to absorb the burst between injection and reply.
const CAPTURE_QUEUE_DEPTH: usize = 256;

/// Raw packet transport bound to a single named interface.
pub struct RawTransport {
    iface: String,
    fd: Arc<AsyncFd<OwnedFd>>,
    rx: mpsc::Receiver<Vec<u8>>,
    capture: JoinHandle<()>,
}

impl RawTransport {
    /// Open a raw socket on `endpoint` and start the capture listener.
    ///
    /// Fails with [`TransportError`] only on operational problems: the
    /// interface does not exist, or the process lacks CAP_NET_RAW.
    pub fn open(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let iface = endpoint.name().to_string();
        let ifindex = interface_index(&iface)?;

        let proto = i32::from((libc::ETH_P_ALL as u16).to_be());
        let socket =
            Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(proto))).map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    TransportError::PermissionDenied {
                        iface: iface.clone(),
                        source: e,
                    }
                } else {
                    TransportError::Io(e)
                }
            })?;
        socket.set_nonblocking(true)?;
        socket.bind(&packet_bind_addr(ifindex))?;

        let fd = Arc::new(AsyncFd::new(OwnedFd::from(socket))?);
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let capture = tokio::spawn(capture_loop(Arc::clone(&fd), tx, iface.clone()));
        debug!(%iface, "raw transport opened");

        Ok(Self {
            iface,
            fd,
            rx,
            capture,
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Inject one frame, fire-and-forget.
    pub fn send(&self, packet: &PacketDescriptor) -> Result<(), TransportError> {
        let frame = packet.frame();
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error().into())
        } else if n as usize != frame.len() {
            Err(io::Error::new(io::ErrorKind::WriteZero, "incomplete frame send").into())
        } else {
            Ok(())
        }
    }

    /// Inject `packet` and wait up to `timeout` for its reply.
    ///
    /// Returns `Ok(None)` when no reply arrives, the expected outcome when
    /// a drop rule is in effect. Frames captured before the injection are
    /// discarded first, so repeated calls never observe each other's
    /// traffic.
    pub async fn send_and_wait(
        &mut self,
        packet: &PacketDescriptor,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.drain();
        self.send(packet)?;

        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(frame)) => {
                    if parsers::is_reply_to(packet, &frame) {
                        return Ok(Some(frame));
                    }
                    // Unrelated traffic (ARP, IPv6 noise), keep waiting.
                }
                Ok(None) => return Err(TransportError::CaptureClosed(self.iface.clone())),
                Err(_elapsed) => return Ok(None),
            }
        }
    }

    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for RawTransport {
    fn drop(&mut self) {
        self.capture.abort();
    }
}

async fn capture_loop(fd: Arc<AsyncFd<OwnedFd>>, tx: mpsc::Sender<Vec<u8>>, iface: String) {
    let mut buf = vec![0u8; ETH_HDR_LEN + MTU];
    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%iface, "capture poll failed: {e}");
                return;
            }
        };

        match guard.try_io(|inner| recv_incoming(inner.as_raw_fd(), &mut buf)) {
            Ok(Ok(Some(n))) => {
                // Bounded queue: drop the frame when the consumer is behind,
                // stop when the consumer is gone.
                if tx.try_send(buf[..n].to_vec()).is_err() && tx.is_closed() {
                    return;
                }
            }
            Ok(Ok(None)) => {} // our own transmission, skip
            Ok(Err(e)) => {
                warn!(%iface, "capture recv failed: {e}");
                return;
            }
            Err(_would_block) => continue,
        }
    }
}

/// Receive one frame, filtering out our own transmissions
/// (`PACKET_OUTGOING`). Returns `Ok(None)` for skipped frames.
fn recv_incoming(fd: i32, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if addr.sll_pkttype as i32 == libc::PACKET_OUTGOING as i32 {
        return Ok(None);
    }
    Ok(Some(n as usize))
}

fn interface_index(name: &str) -> Result<i32, TransportError> {
    let c_name = CString::new(name)
        .map_err(|_| TransportError::InterfaceMissing(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        Err(TransportError::InterfaceMissing(name.to_string()))
    } else {
        Ok(index as i32)
    }
}

fn packet_bind_addr(ifindex: i32) -> SockAddr {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    {
        let sll = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>() };
        sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex;
    }
    unsafe { SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_is_an_operational_error() {
        // Resolved before any socket is created, so this holds without
        // CAP_NET_RAW.
        let err = interface_index("fp-does-not-exist").unwrap_err();
        assert!(matches!(err, TransportError::InterfaceMissing(name) if name.contains("fp-")));
    }

    #[test]
    fn bind_addr_carries_ifindex() {
        let addr = packet_bind_addr(7);
        assert_eq!(
            addr.len() as usize,
            mem::size_of::<libc::sockaddr_ll>()
        );
    }
}
