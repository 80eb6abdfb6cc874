//! # FSCP Crypto
//!
//! Cryptographic primitives for the FreeLAN Secure Channel Protocol.
//!
//! This crate provides:
//! - RSA-PSS (SHA-256) signatures over handshake payloads, with an
//!   HMAC-SHA-256 pre-shared-key alternative
//! - Ephemeral ECDHE key agreement on the negotiated curve
//! - HKDF-SHA256 session key derivation
//! - AES-GCM authenticated encryption for the data plane
//! - X.509 certificate wrapping, hashing and validation policies
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Signatures | RSA-PSS with SHA-256, salt length = digest length |
//! | PSK authentication | HMAC-SHA-256 |
//! | Key Exchange | ECDHE (secp384r1, secp521r1) |
//! | KDF | HKDF-SHA256 |
//! | AEAD | AES-128-GCM / AES-256-GCM |
//! | Certificate hash | SHA-256 over DER |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod cert;
pub mod ecdhe;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod random;
pub mod sign;

pub use aead::{CipherSuite, OpeningKey, SealingKey};
pub use cert::{Certificate, CertificateHash, CertificateValidator, CrlCheck, ValidationPolicy};
pub use ecdhe::{EllipticCurve, EphemeralKeyPair, SharedSecret};
pub use error::CryptoError;
pub use kdf::{derive_session_material, SessionKeyMaterial};
pub use sign::{Authenticator, Identity, PresharedKey, VerificationKey};

/// Host identifier size (random per-endpoint value)
pub const HOST_IDENTIFIER_SIZE: usize = 32;

/// AEAD authentication tag size
pub const TAG_SIZE: usize = 16;

/// AEAD nonce size (8-byte prefix + 4-byte sequence number)
pub const NONCE_SIZE: usize = 12;

/// Per-direction nonce prefix size
pub const NONCE_PREFIX_SIZE: usize = 8;

/// Certificate hash size (SHA-256)
pub const CERTIFICATE_HASH_SIZE: usize = 32;

/// HMAC-SHA-256 output size (the PSK-mode "signature")
pub const HMAC_SIZE: usize = 32;
