//! X.509 certificate wrapping, hashing and validation policies.
//!
//! FSCP identifies peers by their signature certificate. The certificate is
//! exchanged in DER form inside PRESENTATION messages and referenced
//! elsewhere (CONTACT messages, the endpoint's peer index) by its SHA-256
//! hash. Only the RSA public key is ever extracted from the certificate;
//! chain building beyond the configured trust anchors is the embedding
//! application's concern.

use crate::hash::sha256;
use crate::CryptoError;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use std::fmt;
use x509_parser::prelude::{FromDer, X509Certificate};

/// SHA-256 hash of a DER-encoded certificate.
///
/// This is the identifier used in CONTACT and CONTACT_REQUEST messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertificateHash(pub [u8; 32]);

impl CertificateHash {
    /// Hash size in bytes
    pub const SIZE: usize = 32;

    /// Read a hash from a 32-byte slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if the slice is not
    /// exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != Self::SIZE {
            return Err(CryptoError::InvalidCertificate(format!(
                "certificate hash must be {} bytes, got {}",
                Self::SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw hash bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CertificateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateHash({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for CertificateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A peer signature certificate.
///
/// Wraps the DER bytes and the RSA public key extracted from them. The DER
/// is kept verbatim: it is what goes on the wire in PRESENTATION messages
/// and what the certificate hash is computed over.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
    hash: CertificateHash,
}

impl Certificate {
    /// Parse a certificate from DER bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if the DER does not parse
    /// as an X.509 certificate or the subject public key is not RSA.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let (rem, parsed) = X509Certificate::from_der(der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        if !rem.is_empty() {
            return Err(CryptoError::InvalidCertificate(
                "trailing bytes after certificate".to_string(),
            ));
        }

        let spki = parsed.public_key();
        let public_key = RsaPublicKey::from_pkcs1_der(&spki.subject_public_key.data)
            .map_err(|e| CryptoError::InvalidCertificate(format!("not an RSA key: {e}")))?;

        Ok(Self {
            der: der.to_vec(),
            public_key,
            hash: CertificateHash(sha256(der)),
        })
    }

    /// The DER encoding, as received or loaded
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The RSA public key carried by the certificate
    #[must_use]
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SHA-256 over the DER encoding
    #[must_use]
    pub fn hash(&self) -> CertificateHash {
        self.hash
    }

    /// Raw subject name bytes (DER), used for anchor matching
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if re-parsing fails,
    /// which cannot happen for a certificate built with [`Self::from_der`].
    pub fn subject_der(&self) -> Result<Vec<u8>, CryptoError> {
        let (_, parsed) = X509Certificate::from_der(&self.der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        Ok(parsed.tbs_certificate.subject.as_raw().to_vec())
    }

    /// Raw issuer name bytes (DER), used for anchor matching
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCertificate`] if re-parsing fails.
    pub fn issuer_der(&self) -> Result<Vec<u8>, CryptoError> {
        let (_, parsed) = X509Certificate::from_der(&self.der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        Ok(parsed.tbs_certificate.issuer.as_raw().to_vec())
    }

    /// Whether the certificate is within its validity period
    #[must_use]
    pub fn is_time_valid(&self) -> bool {
        match X509Certificate::from_der(&self.der) {
            Ok((_, parsed)) => parsed.validity().is_valid(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({})", self.hash)
    }
}

/// CRL checking behaviour for the default validation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrlCheck {
    /// Do not consult revocation lists
    #[default]
    None,
    /// Check only the final certificate
    LastOnly,
    /// Check the whole chain
    All,
}

/// Certificate validation policy applied to every received PRESENTATION
#[derive(Debug, Clone, Default)]
pub enum ValidationPolicy {
    /// Accept any well-formed certificate
    #[default]
    None,
    /// Validate against a configured set of trust anchors
    Default {
        /// DER encodings of the trusted anchor certificates
        anchors: Vec<Vec<u8>>,
        /// Revocation checking mode
        crl_check: CrlCheck,
    },
}

/// Validation seam called on receipt of every PRESENTATION.
///
/// The built-in [`ValidationPolicy`] implementation covers the two policies
/// the engine must support; embedding applications may substitute their own.
pub trait CertificateValidator: Send + Sync {
    /// Decide whether the given peer certificate is acceptable
    fn validate(&self, certificate: &Certificate) -> bool;
}

impl CertificateValidator for ValidationPolicy {
    fn validate(&self, certificate: &Certificate) -> bool {
        match self {
            Self::None => true,
            Self::Default { anchors, crl_check } => {
                if !certificate.is_time_valid() {
                    return false;
                }
                // Revocation lists are fed in by the embedding application;
                // with no CRL source configured LastOnly/All degrade to None.
                let _ = crl_check;
                let Ok(issuer) = certificate.issuer_der() else {
                    return false;
                };
                anchors.iter().any(|anchor_der| {
                    if anchor_der.as_slice() == certificate.der() {
                        return true;
                    }
                    match Certificate::from_der(anchor_der) {
                        Ok(anchor) => anchor
                            .subject_der()
                            .map(|subject| subject == issuer)
                            .unwrap_or(false),
                        Err(_) => false,
                    }
                })
            }
        }
    }
}
