//! Handshake payload authentication.
//!
//! SESSION_REQUEST and SESSION messages carry a signature over their
//! unsigned payload region. Two modes exist and are never mixed on a link:
//!
//! - **Certificate mode**: RSA-PSS with SHA-256, salt length equal to the
//!   digest length, under the key of the sender's signature certificate.
//! - **Pre-shared-key mode**: HMAC-SHA-256 under a symmetric key configured
//!   on both ends. No certificates are exchanged; PRESENTATION bodies are
//!   empty.
//!
//! Verification failures are indistinguishable from network loss to the
//! peer; the caller drops the message and counts it.

use crate::cert::Certificate;
use crate::CryptoError;
use hmac::{Hmac, Mac};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric pre-shared key for HMAC-mode authentication.
///
/// Key material is zeroized on drop.
#[derive(Clone)]
pub struct PresharedKey(Zeroizing<Vec<u8>>);

impl PresharedKey {
    /// Wrap raw key bytes
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// HMAC-SHA-256 over `payload`
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Constant-time verification of an HMAC-SHA-256 tag
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadSignature`] if the tag does not match.
    pub fn verify(&self, payload: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| CryptoError::BadSignature)
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

/// Local signing credentials: certificate mode or pre-shared-key mode
pub enum Authenticator {
    /// RSA-PSS under the local signature certificate's private key
    Rsa {
        /// The local signature certificate (sent in PRESENTATION)
        certificate: Certificate,
        /// PSS signing key derived from the certificate's private key
        signing_key: SigningKey<Sha256>,
    },
    /// HMAC under a pre-shared key
    Preshared(PresharedKey),
}

impl Authenticator {
    /// Sign a handshake payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SigningFailed`] if RSA-PSS signing fails.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Rsa { signing_key, .. } => {
                let signature = signing_key
                    .try_sign_with_rng(&mut rand_core::OsRng, payload)
                    .map_err(|_| CryptoError::SigningFailed)?;
                Ok(signature.to_vec())
            }
            Self::Preshared(psk) => Ok(psk.sign(payload).to_vec()),
        }
    }
}

/// The local node's cryptographic identity
pub struct Identity {
    authenticator: Authenticator,
}

impl Identity {
    /// Certificate-mode identity from a certificate and its RSA private key
    #[must_use]
    pub fn from_rsa(certificate: Certificate, private_key: RsaPrivateKey) -> Self {
        Self {
            authenticator: Authenticator::Rsa {
                certificate,
                signing_key: SigningKey::new(private_key),
            },
        }
    }

    /// Pre-shared-key identity
    #[must_use]
    pub fn from_preshared(key: PresharedKey) -> Self {
        Self {
            authenticator: Authenticator::Preshared(key),
        }
    }

    /// The local certificate, if in certificate mode
    #[must_use]
    pub fn certificate(&self) -> Option<&Certificate> {
        match &self.authenticator {
            Authenticator::Rsa { certificate, .. } => Some(certificate),
            Authenticator::Preshared(_) => None,
        }
    }

    /// Whether this identity authenticates with a pre-shared key
    #[must_use]
    pub fn is_preshared(&self) -> bool {
        matches!(self.authenticator, Authenticator::Preshared(_))
    }

    /// Sign a handshake payload
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SigningFailed`] if signing fails.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.authenticator.sign(payload)
    }

    /// Build the matching verifier for a remote peer.
    ///
    /// In certificate mode the peer's certificate (from PRESENTATION)
    /// supplies the key; in pre-shared-key mode the shared key does.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if certificate mode is in
    /// use and no peer certificate has been presented yet.
    pub fn verifier_for(
        &self,
        remote_certificate: Option<&Certificate>,
    ) -> Result<VerificationKey, CryptoError> {
        match &self.authenticator {
            Authenticator::Rsa { .. } => {
                let certificate = remote_certificate.ok_or_else(|| {
                    CryptoError::InvalidCertificate(
                        "no certificate presented by peer".to_string(),
                    )
                })?;
                Ok(VerificationKey::from_public_key(
                    certificate.public_key().clone(),
                ))
            }
            Authenticator::Preshared(psk) => Ok(VerificationKey::Preshared(psk.clone())),
        }
    }
}

/// Verification side of [`Authenticator`]
pub enum VerificationKey {
    /// RSA-PSS verification under the peer certificate's public key
    Rsa(VerifyingKey<Sha256>),
    /// HMAC verification under the shared key
    Preshared(PresharedKey),
}

impl VerificationKey {
    /// Build from a peer's raw RSA public key
    #[must_use]
    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self::Rsa(VerifyingKey::new(key))
    }

    /// Verify a handshake signature over `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadSignature`] on any mismatch; malformed
    /// signatures are treated identically to wrong ones.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        match self {
            Self::Rsa(key) => {
                let signature =
                    Signature::try_from(signature).map_err(|_| CryptoError::BadSignature)?;
                key.verify(payload, &signature)
                    .map_err(|_| CryptoError::BadSignature)
            }
            Self::Preshared(psk) => psk.verify(payload, signature),
        }
    }
}
