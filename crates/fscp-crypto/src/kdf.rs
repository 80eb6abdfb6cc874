//! Session key derivation.
//!
//! HKDF-SHA256, extract-then-expand, over the ECDHE shared secret. The info
//! string is the concatenation of both session numbers and both host
//! identifiers so that a (session, host) pair never reuses key material.
//!
//! Both sides must derive identical material while labelling the two
//! directions oppositely. The construction is made order-independent by
//! sorting the (session number, host identifier) pairs on the host
//! identifier bytes: the lexicographically smaller identifier is side A,
//! the other side B. The expand output is laid out as
//! `key_ab || key_ba || prefix_ab || prefix_ba`; each endpoint then picks
//! its sending direction out of that layout.

use crate::aead::CipherSuite;
use crate::ecdhe::SharedSecret;
use crate::{CryptoError, HOST_IDENTIFIER_SIZE, NONCE_PREFIX_SIZE};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// HKDF-Extract salt, fixed for the protocol version
const KDF_SALT: &[u8] = b"fscp-v3-session-keys";

/// Directional key material for one established session
pub struct SessionKeyMaterial {
    /// AEAD key for the local-to-remote direction
    pub local_key: Zeroizing<Vec<u8>>,
    /// AEAD key for the remote-to-local direction
    pub remote_key: Zeroizing<Vec<u8>>,
    /// Nonce prefix for the local-to-remote direction
    pub nonce_prefix_local: [u8; NONCE_PREFIX_SIZE],
    /// Nonce prefix for the remote-to-local direction
    pub nonce_prefix_remote: [u8; NONCE_PREFIX_SIZE],
}

/// Derive both directions' keys and nonce prefixes for a session.
///
/// `local_*` describe this endpoint, `remote_*` the peer. Both sides call
/// this with their own perspective and obtain mirrored material.
///
/// # Errors
///
/// Returns [`CryptoError::DerivationFailed`] if HKDF expansion fails.
pub fn derive_session_material(
    shared: &SharedSecret,
    suite: CipherSuite,
    local_session_number: u32,
    remote_session_number: u32,
    local_host_identifier: &[u8; HOST_IDENTIFIER_SIZE],
    remote_host_identifier: &[u8; HOST_IDENTIFIER_SIZE],
) -> Result<SessionKeyMaterial, CryptoError> {
    let local_is_a = local_host_identifier <= remote_host_identifier;

    let (sn_a, hid_a, sn_b, hid_b) = if local_is_a {
        (
            local_session_number,
            local_host_identifier,
            remote_session_number,
            remote_host_identifier,
        )
    } else {
        (
            remote_session_number,
            remote_host_identifier,
            local_session_number,
            local_host_identifier,
        )
    };

    let mut info = Vec::with_capacity(8 + 2 * HOST_IDENTIFIER_SIZE);
    info.extend_from_slice(&sn_a.to_be_bytes());
    info.extend_from_slice(&sn_b.to_be_bytes());
    info.extend_from_slice(hid_a);
    info.extend_from_slice(hid_b);

    let key_size = suite.key_size();
    let mut okm = Zeroizing::new(vec![0u8; 2 * key_size + 2 * NONCE_PREFIX_SIZE]);

    let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), shared.as_bytes());
    hkdf.expand(&info, &mut okm)
        .map_err(|_| CryptoError::DerivationFailed)?;

    let key_ab = &okm[..key_size];
    let key_ba = &okm[key_size..2 * key_size];
    let prefix_ab = &okm[2 * key_size..2 * key_size + NONCE_PREFIX_SIZE];
    let prefix_ba = &okm[2 * key_size + NONCE_PREFIX_SIZE..];

    let (local_key, remote_key, prefix_local, prefix_remote) = if local_is_a {
        (key_ab, key_ba, prefix_ab, prefix_ba)
    } else {
        (key_ba, key_ab, prefix_ba, prefix_ab)
    };

    let mut nonce_prefix_local = [0u8; NONCE_PREFIX_SIZE];
    nonce_prefix_local.copy_from_slice(prefix_local);
    let mut nonce_prefix_remote = [0u8; NONCE_PREFIX_SIZE];
    nonce_prefix_remote.copy_from_slice(prefix_remote);

    Ok(SessionKeyMaterial {
        local_key: Zeroizing::new(local_key.to_vec()),
        remote_key: Zeroizing::new(remote_key.to_vec()),
        nonce_prefix_local,
        nonce_prefix_remote,
    })
}
