//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Handshake signature did not verify
    #[error("bad signature")]
    BadSignature,

    /// Signing the handshake payload failed
    #[error("signing failed")]
    SigningFailed,

    /// Invalid key length for the selected cipher suite
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// The elliptic curve has no local implementation
    #[error("unsupported elliptic curve: {0}")]
    UnsupportedCurve(&'static str),

    /// The peer's ephemeral public point could not be decoded
    #[error("invalid public key point")]
    InvalidPublicKey,

    /// The certificate could not be parsed or carries no usable key
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The certificate was rejected by the validation policy
    #[error("certificate rejected by policy")]
    CertificateRejected,

    /// Key derivation failed
    #[error("key derivation failed")]
    DerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
