//! Events the endpoint reports to its operator.
//!
//! The endpoint pushes these over an `mpsc` channel instead of invoking
//! per-operation completion handlers; awaitable operations (`greet`) resolve
//! their own futures in addition to emitting the corresponding event.

use fscp_crypto::CertificateHash;
use std::net::SocketAddr;
use std::time::Duration;

/// Why a peer session was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// No traffic received within the session timeout
    Timeout,
    /// Retransmissions exhausted without progress
    Unreachable,
    /// The certificate or negotiation was rejected by policy
    PolicyRejected,
    /// The endpoint is shutting down
    Closed,
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::PolicyRejected => "policy rejected",
            Self::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Notifications from the endpoint
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A session reached the established state
    PeerEstablished {
        /// The peer's UDP address
        addr: SocketAddr,
        /// Hash of the peer's certificate, when in certificate mode
        certificate_hash: Option<CertificateHash>,
    },
    /// A peer session was destroyed
    PeerLost {
        /// The peer's UDP address
        addr: SocketAddr,
        /// Why the session went away
        reason: LossReason,
    },
    /// A hello exchange finished
    HelloCompleted {
        /// The greeted address
        addr: SocketAddr,
        /// Round-trip time on success
        rtt: Option<Duration>,
        /// Whether a response arrived before the attempts ran out
        success: bool,
    },
    /// A peer answered a contact request with an endpoint introduction
    ContactReceived {
        /// The introduced peer's certificate hash
        hash: CertificateHash,
        /// The introduced peer's last-known address
        addr: SocketAddr,
    },
    /// The endpoint hit an unrecoverable I/O error and is shutting down
    FatalError {
        /// Human-readable description
        message: String,
    },
}
