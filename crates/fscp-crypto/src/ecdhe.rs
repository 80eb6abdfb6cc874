//! Ephemeral ECDHE key agreement.
//!
//! Each side generates a fresh keypair per session and publishes the
//! uncompressed SEC1 point inside its SESSION message. The shared secret
//! feeds HKDF (see [`crate::kdf`]).
//!
//! `sect571k1` remains on the wire enum for interoperability with peers
//! that advertise it, but there is no maintained implementation of that
//! binary curve in the ecosystem this crate builds on; generating a keypair
//! on it reports [`CryptoError::UnsupportedCurve`] and default capability
//! lists omit it.

use crate::CryptoError;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use zeroize::Zeroizing;

/// ECDHE group identifiers, with their FSCP wire values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EllipticCurve {
    /// NIST/SECG binary curve sect571k1 (wire id 0x01, not locally usable)
    Sect571k1 = 0x01,
    /// NIST P-384 (wire id 0x02)
    Secp384r1 = 0x02,
    /// NIST P-521 (wire id 0x03)
    Secp521r1 = 0x03,
}

impl EllipticCurve {
    /// Curves this build can actually run, in default preference order
    pub const SUPPORTED: [Self; 2] = [Self::Secp384r1, Self::Secp521r1];

    /// Wire identifier byte
    #[must_use]
    pub fn wire_id(self) -> u8 {
        self as u8
    }

    /// Decode a wire identifier
    #[must_use]
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Sect571k1),
            0x02 => Some(Self::Secp384r1),
            0x03 => Some(Self::Secp521r1),
            _ => None,
        }
    }

    /// Canonical curve name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sect571k1 => "sect571k1",
            Self::Secp384r1 => "secp384r1",
            Self::Secp521r1 => "secp521r1",
        }
    }
}

impl serde::Serialize for EllipticCurve {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for EllipticCurve {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        match name.as_str() {
            "sect571k1" => Ok(Self::Sect571k1),
            "secp384r1" => Ok(Self::Secp384r1),
            "secp521r1" => Ok(Self::Secp521r1),
            other => Err(serde::de::Error::custom(format!(
                "unknown elliptic curve: {other}"
            ))),
        }
    }
}

/// ECDHE shared secret, zeroized on drop
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    /// Raw secret bytes (the x-coordinate of the shared point)
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A per-session ephemeral ECDHE keypair
pub enum EphemeralKeyPair {
    /// P-384 keypair
    P384 {
        /// Ephemeral secret scalar
        secret: p384::ecdh::EphemeralSecret,
        /// Uncompressed SEC1 encoding of the public point
        public: Vec<u8>,
    },
    /// P-521 keypair
    P521 {
        /// Ephemeral secret scalar
        secret: p521::ecdh::EphemeralSecret,
        /// Uncompressed SEC1 encoding of the public point
        public: Vec<u8>,
    },
}

impl EphemeralKeyPair {
    /// Generate a fresh keypair on the given curve.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedCurve`] for `sect571k1`.
    pub fn generate(curve: EllipticCurve) -> Result<Self, CryptoError> {
        match curve {
            EllipticCurve::Sect571k1 => Err(CryptoError::UnsupportedCurve("sect571k1")),
            EllipticCurve::Secp384r1 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut rand_core::OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                Ok(Self::P384 { secret, public })
            }
            EllipticCurve::Secp521r1 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut rand_core::OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                Ok(Self::P521 { secret, public })
            }
        }
    }

    /// The curve this keypair lives on
    #[must_use]
    pub fn curve(&self) -> EllipticCurve {
        match self {
            Self::P384 { .. } => EllipticCurve::Secp384r1,
            Self::P521 { .. } => EllipticCurve::Secp521r1,
        }
    }

    /// Uncompressed SEC1 public point, as sent in SESSION
    #[must_use]
    pub fn public_bytes(&self) -> &[u8] {
        match self {
            Self::P384 { public, .. } | Self::P521 { public, .. } => public,
        }
    }

    /// Complete the agreement with the peer's public point.
    ///
    /// Consumes the keypair: an ephemeral secret is used exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the peer's point does
    /// not decode on this keypair's curve.
    pub fn agree(self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        match self {
            Self::P384 { secret, .. } => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret(Zeroizing::new(
                    shared.raw_secret_bytes().to_vec(),
                )))
            }
            Self::P521 { secret, .. } => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret(Zeroizing::new(
                    shared.raw_secret_bytes().to_vec(),
                )))
            }
        }
    }
}
