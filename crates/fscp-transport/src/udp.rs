//! Shared async UDP socket.

use crate::{TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Default kernel buffer size requested for both directions.
///
/// A single socket serves every peer of an endpoint, so the buffers are
/// sized well above a single flow's needs.
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// The endpoint's shared UDP socket.
///
/// Cheap to clone; all clones refer to the same socket and statistics.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    send_errors: AtomicU64,
    data_dropped: AtomicU64,
}

/// Socket statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Datagrams sent
    pub datagrams_sent: u64,
    /// Datagrams received
    pub datagrams_received: u64,
    /// Failed send attempts
    pub send_errors: u64,
    /// Data datagrams dropped on socket-buffer pressure
    pub data_dropped: u64,
}

impl UdpTransport {
    /// Bind a UDP socket to `addr`.
    ///
    /// Uses `socket2` to request large kernel buffers before handing the
    /// socket to tokio.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if socket creation or binding
    /// fails.
    pub fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        tracing::debug!(local = ?socket.local_addr().ok(), "udp socket bound");

        Ok(Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsInner::default()),
        })
    }

    /// Send a datagram, awaiting socket readiness (control-message path).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`Self::close`], or an I/O
    /// error from the socket.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    /// Send a datagram without blocking (data-plane path).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::QueueFull`] when the socket buffer cannot
    /// take the datagram right now; the caller drops it.
    pub fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        match self.socket.try_send_to(buf, addr) {
            Ok(sent) => {
                self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.stats.data_dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::QueueFull)
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    /// Receive one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`Self::close`], or an I/O
    /// error from the socket.
    pub async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.stats
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// The bound local address
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be read back.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Mark the transport closed; subsequent operations fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            tracing::debug!(local = ?self.socket.local_addr().ok(), "udp socket closed");
        }
    }

    /// Whether [`Self::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.stats.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.stats.datagrams_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
            data_dropped: self.stats.data_dropped.load(Ordering::Relaxed),
        }
    }
}
