//! Data-plane AEAD encryption.
//!
//! AES-GCM with a 12-byte nonce built as `nonce_prefix || sequence_number`
//! (big-endian) and a 16-byte detached tag, so the wire layout can keep the
//! tag ahead of the ciphertext. The associated data is the FSCP header plus
//! the session number and sequence number fields of the datagram.
//!
//! Nonce uniqueness is the caller's invariant: the sequence number is
//! strictly monotonic per direction within a session and the prefix is
//! fresh per session.

use crate::{CryptoError, NONCE_PREFIX_SIZE, NONCE_SIZE, TAG_SIZE};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce, Tag};
use zeroize::Zeroize;

/// Negotiated cipher suites, with their FSCP wire values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CipherSuite {
    /// ECDHE-RSA with AES-128-GCM and SHA-256 (wire id 0x01)
    Aes128GcmSha256 = 0x01,
    /// ECDHE-RSA with AES-256-GCM and SHA-256 (wire id 0x02)
    Aes256GcmSha256 = 0x02,
}

impl CipherSuite {
    /// All suites, in default preference order (strongest first)
    pub const ALL: [Self; 2] = [Self::Aes256GcmSha256, Self::Aes128GcmSha256];

    /// Wire identifier byte
    #[must_use]
    pub fn wire_id(self) -> u8 {
        self as u8
    }

    /// Decode a wire identifier
    #[must_use]
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Aes128GcmSha256),
            0x02 => Some(Self::Aes256GcmSha256),
            _ => None,
        }
    }

    /// AEAD key size in bytes
    #[must_use]
    pub fn key_size(self) -> usize {
        match self {
            Self::Aes128GcmSha256 => 16,
            Self::Aes256GcmSha256 => 32,
        }
    }

    /// Canonical suite name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128GcmSha256 => "ECDHE_RSA_AES128_GCM_SHA256",
            Self::Aes256GcmSha256 => "ECDHE_RSA_AES256_GCM_SHA256",
        }
    }
}

impl serde::Serialize for CipherSuite {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for CipherSuite {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        match name.as_str() {
            "ECDHE_RSA_AES128_GCM_SHA256" => Ok(Self::Aes128GcmSha256),
            "ECDHE_RSA_AES256_GCM_SHA256" => Ok(Self::Aes256GcmSha256),
            other => Err(serde::de::Error::custom(format!(
                "unknown cipher suite: {other}"
            ))),
        }
    }
}

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Cipher {
    fn new(suite: CipherSuite, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != suite.key_size() {
            return Err(CryptoError::InvalidKeyLength {
                expected: suite.key_size(),
                actual: key.len(),
            });
        }
        Ok(match suite {
            CipherSuite::Aes128GcmSha256 => Self::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                    expected: suite.key_size(),
                    actual: key.len(),
                })?,
            )),
            CipherSuite::Aes256GcmSha256 => Self::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                    expected: suite.key_size(),
                    actual: key.len(),
                })?,
            )),
        })
    }
}

fn build_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], sequence_number: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&sequence_number.to_be_bytes());
    nonce
}

/// Sealing (encryption) half of a session's key material
pub struct SealingKey {
    cipher: Cipher,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl SealingKey {
    /// Build a sealing key for one direction of a session.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `key` does not match
    /// the suite's key size.
    pub fn new(
        suite: CipherSuite,
        key: &[u8],
        nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: Cipher::new(suite, key)?,
            nonce_prefix,
        })
    }

    /// Encrypt `buf` in place under `(nonce_prefix, sequence_number)` and
    /// return the detached tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn seal_in_place(
        &self,
        sequence_number: u32,
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; TAG_SIZE], CryptoError> {
        let nonce_bytes = build_nonce(&self.nonce_prefix, sequence_number);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let tag = match &self.cipher {
            Cipher::Aes128(cipher) => cipher
                .encrypt_in_place_detached(nonce, aad, buf)
                .map_err(|_| CryptoError::EncryptionFailed)?,
            Cipher::Aes256(cipher) => cipher
                .encrypt_in_place_detached(nonce, aad, buf)
                .map_err(|_| CryptoError::EncryptionFailed)?,
        };
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }
}

/// Opening (decryption) half of a session's key material
pub struct OpeningKey {
    cipher: Cipher,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl OpeningKey {
    /// Build an opening key for one direction of a session.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `key` does not match
    /// the suite's key size.
    pub fn new(
        suite: CipherSuite,
        key: &[u8],
        nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: Cipher::new(suite, key)?,
            nonce_prefix,
        })
    }

    /// Authenticate and decrypt `buf` in place.
    ///
    /// On failure the buffer contents are unspecified and must be
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure
    /// or malformed tag.
    pub fn open_in_place(
        &self,
        sequence_number: u32,
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let nonce_bytes = build_nonce(&self.nonce_prefix, sequence_number);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let tag = Tag::from_slice(tag);
        let result = match &self.cipher {
            Cipher::Aes128(cipher) => cipher.decrypt_in_place_detached(nonce, aad, buf, tag),
            Cipher::Aes256(cipher) => cipher.decrypt_in_place_detached(nonce, aad, buf, tag),
        };
        if result.is_err() {
            buf.zeroize();
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(suite: CipherSuite) -> (SealingKey, OpeningKey) {
        let key = vec![0x42u8; suite.key_size()];
        let prefix = [7u8; NONCE_PREFIX_SIZE];
        (
            SealingKey::new(suite, &key, prefix).unwrap(),
            OpeningKey::new(suite, &key, prefix).unwrap(),
        )
    }

    #[test]
    fn test_wire_ids() {
        assert_eq!(CipherSuite::Aes128GcmSha256.wire_id(), 0x01);
        assert_eq!(CipherSuite::Aes256GcmSha256.wire_id(), 0x02);
        assert_eq!(CipherSuite::from_wire_id(0x03), None);
        for suite in CipherSuite::ALL {
            assert_eq!(CipherSuite::from_wire_id(suite.wire_id()), Some(suite));
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        for suite in CipherSuite::ALL {
            let (seal, open) = pair(suite);
            let mut buf = b"PING".to_vec();
            let tag = seal.seal_in_place(7, b"aad", &mut buf).unwrap();
            assert_ne!(&buf, b"PING");
            open.open_in_place(7, b"aad", &mut buf, &tag).unwrap();
            assert_eq!(&buf, b"PING");
        }
    }

    #[test]
    fn test_open_rejects_wrong_sequence() {
        let (seal, open) = pair(CipherSuite::Aes256GcmSha256);
        let mut buf = b"payload".to_vec();
        let tag = seal.seal_in_place(1, b"", &mut buf).unwrap();
        assert!(open.open_in_place(2, b"", &mut buf, &tag).is_err());
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let (seal, open) = pair(CipherSuite::Aes128GcmSha256);
        let mut buf = b"payload".to_vec();
        let tag = seal.seal_in_place(1, b"aad-a", &mut buf).unwrap();
        assert!(open.open_in_place(1, b"aad-b", &mut buf, &tag).is_err());
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let (seal, open) = pair(CipherSuite::Aes256GcmSha256);
        let mut buf = b"payload".to_vec();
        let tag = seal.seal_in_place(1, b"", &mut buf).unwrap();
        buf[0] ^= 0x01;
        assert!(open.open_in_place(1, b"", &mut buf, &tag).is_err());
    }

    #[test]
    fn test_open_rejects_short_tag() {
        let (seal, open) = pair(CipherSuite::Aes256GcmSha256);
        let mut buf = b"payload".to_vec();
        let _ = seal.seal_in_place(1, b"", &mut buf).unwrap();
        assert!(open.open_in_place(1, b"", &mut buf, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_distinct_sequences_distinct_ciphertexts() {
        let (seal, _) = pair(CipherSuite::Aes256GcmSha256);
        let mut a = b"same plaintext".to_vec();
        let mut b = b"same plaintext".to_vec();
        let _ = seal.seal_in_place(1, b"", &mut a).unwrap();
        let _ = seal.seal_in_place(2, b"", &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_length_checked() {
        assert!(matches!(
            SealingKey::new(CipherSuite::Aes256GcmSha256, &[0u8; 16], [0; 8]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let (seal, open) = pair(CipherSuite::Aes128GcmSha256);
        let mut buf = Vec::new();
        let tag = seal.seal_in_place(0, b"header", &mut buf).unwrap();
        open.open_in_place(0, b"header", &mut buf, &tag).unwrap();
        assert!(buf.is_empty());
    }
}
