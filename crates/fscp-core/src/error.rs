//! Error types for the FSCP core engine.

use thiserror::Error;

/// Core engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire format error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Session error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] fscp_crypto::CryptoError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] fscp_transport::TransportError),

    /// Memory pool exhausted with heap fallback disabled
    #[error("memory pool exhausted")]
    PoolExhausted,

    /// Invalid configuration or argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Wire-format errors.
///
/// Every variant maps to "drop and count" at the session layer; parsing
/// never panics and never surfaces anything to the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header
    #[error("datagram too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Protocol version byte is not 3
    #[error("unknown protocol version: {0}")]
    UnknownVersion(u8),

    /// Unrecognized message type byte
    #[error("unknown message type: 0x{0:02X}")]
    UnknownType(u8),

    /// Declared body length disagrees with the datagram size
    #[error("body length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Length field value
        declared: usize,
        /// Bytes actually present after the header
        actual: usize,
    },

    /// A nested length field overruns the body
    #[error("truncated message body")]
    Truncated,

    /// Structurally invalid body (bad sub-encoding)
    #[error("malformed message body")]
    Malformed,

    /// Output buffer cannot hold the message
    #[error("buffer too small: need {needed}, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Body would exceed the 16-bit length field
    #[error("message body too large")]
    BodyTooLarge,
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("invalid state for operation")]
    InvalidState,

    /// No established session keys
    #[error("no session keys available")]
    NoKeys,

    /// The peer's chosen suite or curve is outside the advertised capabilities
    #[error("negotiation mismatch: {0}")]
    NegotiationMismatch(&'static str),

    /// No mutually supported cipher suite or curve
    #[error("no common {0}")]
    NoCommonAlgorithm(&'static str),

    /// Greet or request did not complete in time
    #[error("timed out")]
    TimedOut,

    /// The peer session was destroyed
    #[error("peer lost: {0}")]
    PeerLost(String),

    /// The endpoint has been closed
    #[error("endpoint closed")]
    Closed,
}
