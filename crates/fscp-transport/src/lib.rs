//! # FSCP Transport
//!
//! The UDP socket layer for the FSCP engine. One socket is shared by every
//! peer session of an endpoint; the engine assumes UDP and nothing else.
//!
//! Two send paths exist because the protocol treats message classes
//! differently under socket-buffer pressure:
//!
//! - [`UdpTransport::send_to`] awaits socket readiness and is used for
//!   control messages (HELLO, PRESENTATION, SESSION_*), which must not be
//!   dropped locally.
//! - [`UdpTransport::try_send_to`] never blocks and reports
//!   [`TransportError::QueueFull`]; data-plane datagrams are simply dropped
//!   on that path, the tunnel being unreliable by design.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod udp;

pub use udp::{TransportStats, UdpTransport};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport has been closed
    #[error("transport is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// The socket send buffer is full (non-blocking path only)
    #[error("send queue full")]
    QueueFull,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
