//! Per-peer protocol state.
//!
//! All state for one remote peer lives in a [`PeerSession`]: the handshake
//! state machine, the established key sets, sequence numbers, replay
//! window, retransmission pacing and the contact sub-protocol. The session
//! performs no I/O of its own; every handler returns [`Output`] commands
//! for the endpoint to execute, so sessions stay synchronous and the
//! endpoint keeps sole ownership of the socket and the tap device.

mod replay;
#[allow(clippy::module_inception)]
mod session;

pub use replay::{ReplayWindow, WINDOW_SIZE};
pub use session::{PeerCounters, PeerSession, PeerState};

use crate::events::EndpointEvent;
use crate::pool::{PooledBuffer, SharedBuffer};
use fscp_crypto::CertificateHash;
use std::net::SocketAddr;

/// Drop class of an outbound datagram under socket-buffer pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Must not be dropped locally; sent on the awaiting path
    Control,
    /// May be dropped; the tunnel is unreliable by design
    Data,
}

/// A command from a peer session to its endpoint
#[derive(Debug)]
pub enum Output {
    /// Send a datagram to the peer's address
    Transmit {
        /// The complete datagram
        datagram: SharedBuffer,
        /// Drop class under backpressure
        class: MessageClass,
    },
    /// Hand a decrypted frame to the router; the plaintext starts at
    /// [`crate::wire::DATA_PAYLOAD_OFFSET`]
    Deliver {
        /// Channel the frame arrived on (0..=14)
        channel: u8,
        /// The decrypted datagram buffer
        datagram: PooledBuffer,
    },
    /// Report an event to the operator
    Event(EndpointEvent),
    /// Greet an address learned through a CONTACT introduction
    GreetAddress(SocketAddr),
    /// Resolve certificate hashes from a CONTACT_REQUEST against the
    /// endpoint's peer index
    ContactLookup(Vec<CertificateHash>),
    /// A hello exchange finished; lets the endpoint resolve the exact
    /// awaiting `greet` call (the public event carries no unique number)
    HelloResult {
        /// The unique number of the completed exchange
        unique_number: u32,
        /// Round-trip time on success
        rtt: Option<std::time::Duration>,
        /// Whether a response arrived in time
        success: bool,
    },
}
