use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// A datagram socket registered with a [`RunLoop`](super::RunLoop).
///
/// Readiness and receiving go through tokio; sends use a cloned blocking-free
/// std handle so they work outside the loop's wait.
#[derive(Debug)]
pub struct LoopSocket {
    io: UdpSocket,
    sender: std::net::UdpSocket,
}

impl LoopSocket {
    pub(super) fn new(io: UdpSocket, sender: std::net::UdpSocket) -> Self {
        Self { io, sender }
    }

    pub(super) async fn readable(&self) -> io::Result<()> {
        self.io.readable().await
    }

    /// Receive one datagram without blocking
    ///
    /// # Errors
    ///
    /// Returns `io::ErrorKind::WouldBlock` when nothing is queued.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.io.try_recv_from(buf)
    }

    /// Send one datagram without blocking
    ///
    /// # Errors
    ///
    /// Returns the socket error, including `WouldBlock` when the send buffer
    /// is full.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sender.send_to(buf, target)
    }

    /// Local address
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }
}
