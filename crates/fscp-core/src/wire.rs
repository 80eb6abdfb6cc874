//! FSCP message encoding and decoding.
//!
//! Every datagram starts with a fixed 4-byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   version=3   |     type      |         body length           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           body ...                            |
//! ```
//!
//! All multi-byte fields are big-endian. The body length counts only the
//! bytes after the header; a datagram whose declared length disagrees with
//! its actual size is dropped. Parsing is zero-copy: views borrow from the
//! datagram buffer and no parse path panics on any input.

use crate::error::WireError;
use fscp_crypto::{CertificateHash, CipherSuite, EllipticCurve};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// FSCP protocol version
pub const PROTOCOL_VERSION: u8 = 3;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 4;

/// Host identifier size in bytes
pub const HOST_IDENTIFIER_SIZE: usize = 32;

/// AEAD tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Offset of the session number field in a DATA datagram
pub const DATA_SESSION_OFFSET: usize = HEADER_SIZE;

/// Offset of the sequence number field in a DATA datagram
pub const DATA_SEQUENCE_OFFSET: usize = HEADER_SIZE + 4;

/// Offset of the AEAD tag in a DATA datagram
pub const DATA_TAG_OFFSET: usize = HEADER_SIZE + 8;

/// Offset of the ciphertext in a DATA datagram
pub const DATA_PAYLOAD_OFFSET: usize = DATA_TAG_OFFSET + TAG_SIZE;

/// The associated data covers the header plus session and sequence numbers
pub const DATA_AAD_SIZE: usize = DATA_SEQUENCE_OFFSET + 4;

/// Channel reserved for control sub-messages
pub const CONTROL_CHANNEL: u8 = 15;

/// Number of data channels (0..=15)
pub const CHANNEL_COUNT: u8 = 16;

const TYPE_HELLO_REQUEST: u8 = 0x00;
const TYPE_HELLO_RESPONSE: u8 = 0x01;
const TYPE_PRESENTATION: u8 = 0x02;
const TYPE_SESSION_REQUEST: u8 = 0x03;
const TYPE_SESSION: u8 = 0x04;
const TYPE_DATA_BASE: u8 = 0x70;
const TYPE_CONTACT_REQUEST: u8 = 0xFD;
const TYPE_CONTACT: u8 = 0xFE;
const TYPE_KEEP_ALIVE: u8 = 0xFF;

const ENDPOINT_FAMILY_IPV4: u8 = 4;
const ENDPOINT_FAMILY_IPV6: u8 = 6;

/// What a DATA-family datagram carries.
///
/// CONTACT_REQUEST, CONTACT and KEEP_ALIVE use their own type bytes but
/// share the DATA body layout and the control channel's sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Tunnelled frame on channel 0..=14
    Channel(u8),
    /// Certificate hashes the sender wants introductions for
    ContactRequest,
    /// Endpoint introductions for previously requested hashes
    Contact,
    /// Idle-link probe with random padding
    KeepAlive,
}

impl DataKind {
    /// The wire type byte for this kind
    #[must_use]
    pub fn type_byte(self) -> u8 {
        match self {
            Self::Channel(channel) => TYPE_DATA_BASE + (channel & 0x0F),
            Self::ContactRequest => TYPE_CONTACT_REQUEST,
            Self::Contact => TYPE_CONTACT,
            Self::KeepAlive => TYPE_KEEP_ALIVE,
        }
    }

    /// Whether this kind belongs to the control channel
    #[must_use]
    pub fn is_control(self) -> bool {
        !matches!(self, Self::Channel(channel) if channel < CONTROL_CHANNEL)
    }
}

/// Handshake messages that carry a trailing signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    /// SESSION_REQUEST (type 0x03)
    SessionRequest,
    /// SESSION (type 0x04)
    Session,
}

impl HandshakeKind {
    fn type_byte(self) -> u8 {
        match self {
            Self::SessionRequest => TYPE_SESSION_REQUEST,
            Self::Session => TYPE_SESSION,
        }
    }
}

/// A parsed FSCP datagram (zero-copy)
#[derive(Debug)]
pub enum Message<'a> {
    /// HELLO_REQUEST: liveness probe with an echoed unique number
    HelloRequest {
        /// The initiator's unique number
        unique_number: u32,
    },
    /// HELLO_RESPONSE: echo of a HELLO_REQUEST
    HelloResponse {
        /// The echoed unique number
        unique_number: u32,
    },
    /// PRESENTATION: the sender's DER certificate (empty in PSK mode)
    Presentation(PresentationView<'a>),
    /// SESSION_REQUEST: signed capability advertisement
    SessionRequest(SessionRequestView<'a>),
    /// SESSION: signed cipher choice and ephemeral public key
    Session(SessionView<'a>),
    /// DATA family: encrypted payload
    Data(DataView<'a>),
}

/// Borrowed view of a PRESENTATION body
#[derive(Debug)]
pub struct PresentationView<'a> {
    certificate_der: &'a [u8],
}

impl<'a> PresentationView<'a> {
    /// The DER certificate bytes; empty in pre-shared-key mode
    #[must_use]
    pub fn certificate_der(&self) -> &'a [u8] {
        self.certificate_der
    }
}

/// Borrowed view of a SESSION_REQUEST body
#[derive(Debug)]
pub struct SessionRequestView<'a> {
    session_number: u32,
    host_identifier: [u8; HOST_IDENTIFIER_SIZE],
    cipher_suites: &'a [u8],
    elliptic_curves: &'a [u8],
    signature: &'a [u8],
    unsigned_payload: &'a [u8],
}

impl<'a> SessionRequestView<'a> {
    /// The sender's session number
    #[must_use]
    pub fn session_number(&self) -> u32 {
        self.session_number
    }

    /// The sender's host identifier
    #[must_use]
    pub fn host_identifier(&self) -> &[u8; HOST_IDENTIFIER_SIZE] {
        &self.host_identifier
    }

    /// Advertised cipher suites, unknown identifiers skipped
    #[must_use]
    pub fn cipher_suites(&self) -> Vec<CipherSuite> {
        self.cipher_suites
            .iter()
            .filter_map(|&id| CipherSuite::from_wire_id(id))
            .collect()
    }

    /// Advertised elliptic curves, unknown identifiers skipped
    #[must_use]
    pub fn elliptic_curves(&self) -> Vec<EllipticCurve> {
        self.elliptic_curves
            .iter()
            .filter_map(|&id| EllipticCurve::from_wire_id(id))
            .collect()
    }

    /// The signature trailing the unsigned payload
    #[must_use]
    pub fn signature(&self) -> &'a [u8] {
        self.signature
    }

    /// The exact byte region the signature covers
    #[must_use]
    pub fn unsigned_payload(&self) -> &'a [u8] {
        self.unsigned_payload
    }
}

/// Borrowed view of a SESSION body
#[derive(Debug)]
pub struct SessionView<'a> {
    session_number: u32,
    host_identifier: [u8; HOST_IDENTIFIER_SIZE],
    cipher_suite: u8,
    elliptic_curve: u8,
    public_key: &'a [u8],
    signature: &'a [u8],
    unsigned_payload: &'a [u8],
}

impl<'a> SessionView<'a> {
    /// The sender's session number
    #[must_use]
    pub fn session_number(&self) -> u32 {
        self.session_number
    }

    /// The sender's host identifier
    #[must_use]
    pub fn host_identifier(&self) -> &[u8; HOST_IDENTIFIER_SIZE] {
        &self.host_identifier
    }

    /// The chosen cipher suite, if the identifier is known
    #[must_use]
    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        CipherSuite::from_wire_id(self.cipher_suite)
    }

    /// The chosen elliptic curve, if the identifier is known
    #[must_use]
    pub fn elliptic_curve(&self) -> Option<EllipticCurve> {
        EllipticCurve::from_wire_id(self.elliptic_curve)
    }

    /// The sender's ephemeral public point (uncompressed SEC1)
    #[must_use]
    pub fn public_key(&self) -> &'a [u8] {
        self.public_key
    }

    /// The signature trailing the unsigned payload
    #[must_use]
    pub fn signature(&self) -> &'a [u8] {
        self.signature
    }

    /// The exact byte region the signature covers
    #[must_use]
    pub fn unsigned_payload(&self) -> &'a [u8] {
        self.unsigned_payload
    }
}

/// Borrowed view of a DATA-family body
#[derive(Debug)]
pub struct DataView<'a> {
    kind: DataKind,
    session_number: u32,
    sequence_number: u32,
    aad: &'a [u8],
    tag: &'a [u8],
    ciphertext: &'a [u8],
}

impl<'a> DataView<'a> {
    /// What the datagram carries
    #[must_use]
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// The sender's session number
    #[must_use]
    pub fn session_number(&self) -> u32 {
        self.session_number
    }

    /// The per-direction sequence number (feeds the AEAD nonce)
    #[must_use]
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// The associated data region (header through sequence number)
    #[must_use]
    pub fn aad(&self) -> &'a [u8] {
        self.aad
    }

    /// The 16-byte AEAD tag
    #[must_use]
    pub fn tag(&self) -> &'a [u8] {
        self.tag
    }

    /// The ciphertext (zero-copy)
    #[must_use]
    pub fn ciphertext(&self) -> &'a [u8] {
        self.ciphertext
    }
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, WireError> {
    let bytes: [u8; 2] = buf
        .get(at..at + 2)
        .ok_or(WireError::Truncated)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, WireError> {
    let bytes: [u8; 4] = buf
        .get(at..at + 4)
        .ok_or(WireError::Truncated)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Parse a datagram into a message view.
///
/// # Errors
///
/// Returns a [`WireError`] for any structural problem: short datagram,
/// unknown version or type, declared length that disagrees with the
/// datagram size, or a nested length overrun. Callers drop and count.
pub fn parse(datagram: &[u8]) -> Result<Message<'_>, WireError> {
    if datagram.len() < HEADER_SIZE {
        return Err(WireError::TooShort {
            expected: HEADER_SIZE,
            actual: datagram.len(),
        });
    }
    if datagram[0] != PROTOCOL_VERSION {
        return Err(WireError::UnknownVersion(datagram[0]));
    }
    let type_byte = datagram[1];
    let declared = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    let body = &datagram[HEADER_SIZE..];
    if declared != body.len() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    match type_byte {
        TYPE_HELLO_REQUEST | TYPE_HELLO_RESPONSE => {
            if body.len() != 4 {
                return Err(WireError::Malformed);
            }
            let unique_number = read_u32(body, 0)?;
            Ok(if type_byte == TYPE_HELLO_REQUEST {
                Message::HelloRequest { unique_number }
            } else {
                Message::HelloResponse { unique_number }
            })
        }
        TYPE_PRESENTATION => Ok(Message::Presentation(PresentationView {
            certificate_der: body,
        })),
        TYPE_SESSION_REQUEST => parse_session_request(body).map(Message::SessionRequest),
        TYPE_SESSION => parse_session(body).map(Message::Session),
        TYPE_DATA_BASE..=0x7F => {
            parse_data(datagram, DataKind::Channel(type_byte - TYPE_DATA_BASE)).map(Message::Data)
        }
        TYPE_CONTACT_REQUEST => parse_data(datagram, DataKind::ContactRequest).map(Message::Data),
        TYPE_CONTACT => parse_data(datagram, DataKind::Contact).map(Message::Data),
        TYPE_KEEP_ALIVE => parse_data(datagram, DataKind::KeepAlive).map(Message::Data),
        other => Err(WireError::UnknownType(other)),
    }
}

fn parse_session_request(body: &[u8]) -> Result<SessionRequestView<'_>, WireError> {
    let session_number = read_u32(body, 0)?;
    let hid_end = 4 + HOST_IDENTIFIER_SIZE;
    let host_identifier: [u8; HOST_IDENTIFIER_SIZE] = body
        .get(4..hid_end)
        .ok_or(WireError::Truncated)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;

    let cs_len = read_u16(body, hid_end)? as usize;
    let cs_start = hid_end + 2;
    let cs_end = cs_start.checked_add(cs_len).ok_or(WireError::Truncated)?;
    let cipher_suites = body.get(cs_start..cs_end).ok_or(WireError::Truncated)?;

    let ec_len = read_u16(body, cs_end)? as usize;
    let ec_start = cs_end + 2;
    let ec_end = ec_start.checked_add(ec_len).ok_or(WireError::Truncated)?;
    let elliptic_curves = body.get(ec_start..ec_end).ok_or(WireError::Truncated)?;

    let sig_len = read_u16(body, ec_end)? as usize;
    let sig_start = ec_end + 2;
    let sig_end = sig_start.checked_add(sig_len).ok_or(WireError::Truncated)?;
    let signature = body.get(sig_start..sig_end).ok_or(WireError::Truncated)?;
    if sig_end != body.len() {
        return Err(WireError::Malformed);
    }

    Ok(SessionRequestView {
        session_number,
        host_identifier,
        cipher_suites,
        elliptic_curves,
        signature,
        unsigned_payload: &body[..ec_end],
    })
}

fn parse_session(body: &[u8]) -> Result<SessionView<'_>, WireError> {
    let session_number = read_u32(body, 0)?;
    let hid_end = 4 + HOST_IDENTIFIER_SIZE;
    let host_identifier: [u8; HOST_IDENTIFIER_SIZE] = body
        .get(4..hid_end)
        .ok_or(WireError::Truncated)?
        .try_into()
        .map_err(|_| WireError::Truncated)?;

    let fixed = body.get(hid_end..hid_end + 4).ok_or(WireError::Truncated)?;
    let cipher_suite = fixed[0];
    let elliptic_curve = fixed[1];
    // Two bytes of padding keep the public key length aligned.
    if fixed[2] != 0 || fixed[3] != 0 {
        return Err(WireError::Malformed);
    }

    let pub_len = read_u16(body, hid_end + 4)? as usize;
    let pub_start = hid_end + 6;
    let pub_end = pub_start.checked_add(pub_len).ok_or(WireError::Truncated)?;
    let public_key = body.get(pub_start..pub_end).ok_or(WireError::Truncated)?;

    let sig_len = read_u16(body, pub_end)? as usize;
    let sig_start = pub_end + 2;
    let sig_end = sig_start.checked_add(sig_len).ok_or(WireError::Truncated)?;
    let signature = body.get(sig_start..sig_end).ok_or(WireError::Truncated)?;
    if sig_end != body.len() {
        return Err(WireError::Malformed);
    }

    Ok(SessionView {
        session_number,
        host_identifier,
        cipher_suite,
        elliptic_curve,
        public_key,
        signature,
        unsigned_payload: &body[..pub_end],
    })
}

fn parse_data(datagram: &[u8], kind: DataKind) -> Result<DataView<'_>, WireError> {
    if datagram.len() < DATA_PAYLOAD_OFFSET {
        return Err(WireError::TooShort {
            expected: DATA_PAYLOAD_OFFSET,
            actual: datagram.len(),
        });
    }
    Ok(DataView {
        kind,
        session_number: read_u32(datagram, DATA_SESSION_OFFSET)?,
        sequence_number: read_u32(datagram, DATA_SEQUENCE_OFFSET)?,
        aad: &datagram[..DATA_AAD_SIZE],
        tag: &datagram[DATA_TAG_OFFSET..DATA_PAYLOAD_OFFSET],
        ciphertext: &datagram[DATA_PAYLOAD_OFFSET..],
    })
}

fn write_header(buf: &mut [u8], type_byte: u8, body_len: usize) -> Result<(), WireError> {
    if body_len > u16::MAX as usize {
        return Err(WireError::BodyTooLarge);
    }
    buf[0] = PROTOCOL_VERSION;
    buf[1] = type_byte;
    buf[2..4].copy_from_slice(&(body_len as u16).to_be_bytes());
    Ok(())
}

fn check_capacity(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Write a HELLO_REQUEST datagram; returns the datagram size.
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] if `buf` cannot hold 8 bytes.
pub fn write_hello_request(buf: &mut [u8], unique_number: u32) -> Result<usize, WireError> {
    write_hello(buf, TYPE_HELLO_REQUEST, unique_number)
}

/// Write a HELLO_RESPONSE datagram; returns the datagram size.
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] if `buf` cannot hold 8 bytes.
pub fn write_hello_response(buf: &mut [u8], unique_number: u32) -> Result<usize, WireError> {
    write_hello(buf, TYPE_HELLO_RESPONSE, unique_number)
}

fn write_hello(buf: &mut [u8], type_byte: u8, unique_number: u32) -> Result<usize, WireError> {
    let total = HEADER_SIZE + 4;
    check_capacity(buf, total)?;
    write_header(buf, type_byte, 4)?;
    buf[HEADER_SIZE..total].copy_from_slice(&unique_number.to_be_bytes());
    Ok(total)
}

/// Write a PRESENTATION datagram carrying the DER certificate (which may be
/// empty in pre-shared-key mode); returns the datagram size.
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] or [`WireError::BodyTooLarge`].
pub fn write_presentation(buf: &mut [u8], certificate_der: &[u8]) -> Result<usize, WireError> {
    let total = HEADER_SIZE + certificate_der.len();
    check_capacity(buf, total)?;
    write_header(buf, TYPE_PRESENTATION, certificate_der.len())?;
    buf[HEADER_SIZE..total].copy_from_slice(certificate_der);
    Ok(total)
}

/// Write the unsigned payload of a SESSION_REQUEST starting at the body
/// offset; returns the unsigned payload size. The caller signs
/// `buf[HEADER_SIZE..HEADER_SIZE + size]` and completes the datagram with
/// [`seal_handshake`].
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] if the buffer cannot hold the
/// payload.
pub fn write_session_request_unsigned(
    buf: &mut [u8],
    session_number: u32,
    host_identifier: &[u8; HOST_IDENTIFIER_SIZE],
    cipher_suites: &[CipherSuite],
    elliptic_curves: &[EllipticCurve],
) -> Result<usize, WireError> {
    let unsigned = 4 + HOST_IDENTIFIER_SIZE + 2 + cipher_suites.len() + 2 + elliptic_curves.len();
    check_capacity(buf, HEADER_SIZE + unsigned)?;

    let body = &mut buf[HEADER_SIZE..];
    body[..4].copy_from_slice(&session_number.to_be_bytes());
    body[4..4 + HOST_IDENTIFIER_SIZE].copy_from_slice(host_identifier);

    let mut at = 4 + HOST_IDENTIFIER_SIZE;
    body[at..at + 2].copy_from_slice(&(cipher_suites.len() as u16).to_be_bytes());
    at += 2;
    for suite in cipher_suites {
        body[at] = suite.wire_id();
        at += 1;
    }
    body[at..at + 2].copy_from_slice(&(elliptic_curves.len() as u16).to_be_bytes());
    at += 2;
    for curve in elliptic_curves {
        body[at] = curve.wire_id();
        at += 1;
    }

    debug_assert_eq!(at, unsigned);
    Ok(unsigned)
}

/// Write the unsigned payload of a SESSION starting at the body offset;
/// returns the unsigned payload size. Complete with [`seal_handshake`].
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] if the buffer cannot hold the
/// payload, or [`WireError::BodyTooLarge`] for an oversized public key.
pub fn write_session_unsigned(
    buf: &mut [u8],
    session_number: u32,
    host_identifier: &[u8; HOST_IDENTIFIER_SIZE],
    cipher_suite: CipherSuite,
    elliptic_curve: EllipticCurve,
    public_key: &[u8],
) -> Result<usize, WireError> {
    if public_key.len() > u16::MAX as usize {
        return Err(WireError::BodyTooLarge);
    }
    let unsigned = 4 + HOST_IDENTIFIER_SIZE + 4 + 2 + public_key.len();
    check_capacity(buf, HEADER_SIZE + unsigned)?;

    let body = &mut buf[HEADER_SIZE..];
    body[..4].copy_from_slice(&session_number.to_be_bytes());
    body[4..4 + HOST_IDENTIFIER_SIZE].copy_from_slice(host_identifier);

    let mut at = 4 + HOST_IDENTIFIER_SIZE;
    body[at] = cipher_suite.wire_id();
    body[at + 1] = elliptic_curve.wire_id();
    body[at + 2] = 0;
    body[at + 3] = 0;
    at += 4;
    body[at..at + 2].copy_from_slice(&(public_key.len() as u16).to_be_bytes());
    at += 2;
    body[at..at + public_key.len()].copy_from_slice(public_key);
    at += public_key.len();

    debug_assert_eq!(at, unsigned);
    Ok(unsigned)
}

/// Append `signature` after an unsigned handshake payload and fill in the
/// header; returns the total datagram size.
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] or [`WireError::BodyTooLarge`].
pub fn seal_handshake(
    buf: &mut [u8],
    kind: HandshakeKind,
    unsigned_len: usize,
    signature: &[u8],
) -> Result<usize, WireError> {
    if signature.len() > u16::MAX as usize {
        return Err(WireError::BodyTooLarge);
    }
    let body_len = unsigned_len + 2 + signature.len();
    let total = HEADER_SIZE + body_len;
    check_capacity(buf, total)?;

    let at = HEADER_SIZE + unsigned_len;
    buf[at..at + 2].copy_from_slice(&(signature.len() as u16).to_be_bytes());
    buf[at + 2..total].copy_from_slice(signature);
    write_header(buf, kind.type_byte(), body_len)?;
    Ok(total)
}

/// Lay out a DATA-family datagram: header, session number, sequence number,
/// zeroed tag, plaintext copied into the ciphertext position. Returns the
/// total datagram size. The caller encrypts
/// `buf[DATA_PAYLOAD_OFFSET..total]` in place with
/// `aad = buf[..DATA_AAD_SIZE]` and stores the tag with [`set_data_tag`].
///
/// # Errors
///
/// Returns [`WireError::BufferTooSmall`] or [`WireError::BodyTooLarge`].
pub fn write_data_frame(
    buf: &mut [u8],
    kind: DataKind,
    session_number: u32,
    sequence_number: u32,
    plaintext: &[u8],
) -> Result<usize, WireError> {
    let body_len = 8 + TAG_SIZE + plaintext.len();
    let total = HEADER_SIZE + body_len;
    check_capacity(buf, total)?;
    write_header(buf, kind.type_byte(), body_len)?;
    buf[DATA_SESSION_OFFSET..DATA_SESSION_OFFSET + 4]
        .copy_from_slice(&session_number.to_be_bytes());
    buf[DATA_SEQUENCE_OFFSET..DATA_SEQUENCE_OFFSET + 4]
        .copy_from_slice(&sequence_number.to_be_bytes());
    buf[DATA_TAG_OFFSET..DATA_PAYLOAD_OFFSET].fill(0);
    buf[DATA_PAYLOAD_OFFSET..total].copy_from_slice(plaintext);
    Ok(total)
}

/// Store the detached AEAD tag into a laid-out DATA datagram
pub fn set_data_tag(buf: &mut [u8], tag: &[u8; TAG_SIZE]) {
    buf[DATA_TAG_OFFSET..DATA_PAYLOAD_OFFSET].copy_from_slice(tag);
}

/// Encode a CONTACT_REQUEST plaintext: concatenated certificate hashes
#[must_use]
pub fn encode_hash_list(hashes: &[CertificateHash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hashes.len() * CertificateHash::SIZE);
    for hash in hashes {
        out.extend_from_slice(hash.as_bytes());
    }
    out
}

/// Decode a CONTACT_REQUEST plaintext.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] if the length is not a multiple of the
/// hash size.
pub fn parse_hash_list(buf: &[u8]) -> Result<Vec<CertificateHash>, WireError> {
    if buf.len() % CertificateHash::SIZE != 0 {
        return Err(WireError::Malformed);
    }
    Ok(buf
        .chunks_exact(CertificateHash::SIZE)
        .map(|chunk| {
            CertificateHash::from_slice(chunk).expect("chunk size matches hash size")
        })
        .collect())
}

/// Encode a CONTACT plaintext: `hash || family || address || port` entries
#[must_use]
pub fn encode_contact_map(entries: &[(CertificateHash, SocketAddr)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (hash, endpoint) in entries {
        out.extend_from_slice(hash.as_bytes());
        match endpoint.ip() {
            IpAddr::V4(addr) => {
                out.push(ENDPOINT_FAMILY_IPV4);
                out.extend_from_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                out.push(ENDPOINT_FAMILY_IPV6);
                out.extend_from_slice(&addr.octets());
            }
        }
        out.extend_from_slice(&endpoint.port().to_be_bytes());
    }
    out
}

/// Decode a CONTACT plaintext.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] on a truncated entry or an unknown
/// endpoint family.
pub fn parse_contact_map(buf: &[u8]) -> Result<Vec<(CertificateHash, SocketAddr)>, WireError> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < buf.len() {
        let hash_end = at + CertificateHash::SIZE;
        let hash = CertificateHash::from_slice(buf.get(at..hash_end).ok_or(WireError::Malformed)?)
            .map_err(|_| WireError::Malformed)?;
        let family = *buf.get(hash_end).ok_or(WireError::Malformed)?;
        at = hash_end + 1;
        let ip: IpAddr = match family {
            ENDPOINT_FAMILY_IPV4 => {
                let octets: [u8; 4] = buf
                    .get(at..at + 4)
                    .ok_or(WireError::Malformed)?
                    .try_into()
                    .map_err(|_| WireError::Malformed)?;
                at += 4;
                Ipv4Addr::from(octets).into()
            }
            ENDPOINT_FAMILY_IPV6 => {
                let octets: [u8; 16] = buf
                    .get(at..at + 16)
                    .ok_or(WireError::Malformed)?
                    .try_into()
                    .map_err(|_| WireError::Malformed)?;
                at += 16;
                Ipv6Addr::from(octets).into()
            }
            _ => return Err(WireError::Malformed),
        };
        let port = read_u16(buf, at).map_err(|_| WireError::Malformed)?;
        at += 2;
        out.push((hash, SocketAddr::new(ip, port)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_request_wire_bytes() {
        let mut buf = [0u8; 64];
        let size = write_hello_request(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(&buf[..size], &[0x03, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_hello_response_wire_bytes() {
        let mut buf = [0u8; 64];
        let size = write_hello_response(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(&buf[..size], &[0x03, 0x01, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_hello_roundtrip() {
        let mut buf = [0u8; 64];
        let size = write_hello_request(&mut buf, 42).unwrap();
        match parse(&buf[..size]).unwrap() {
            Message::HelloRequest { unique_number } => assert_eq!(unique_number, 42),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_presentation_roundtrip() {
        let mut buf = [0u8; 256];
        let der = b"fake der bytes";
        let size = write_presentation(&mut buf, der).unwrap();
        match parse(&buf[..size]).unwrap() {
            Message::Presentation(view) => assert_eq!(view.certificate_der(), der),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_empty_presentation() {
        let mut buf = [0u8; 16];
        let size = write_presentation(&mut buf, &[]).unwrap();
        assert_eq!(size, HEADER_SIZE);
        match parse(&buf[..size]).unwrap() {
            Message::Presentation(view) => assert!(view.certificate_der().is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_session_request_roundtrip() {
        let mut buf = [0u8; 512];
        let hid = [7u8; HOST_IDENTIFIER_SIZE];
        let suites = [CipherSuite::Aes256GcmSha256, CipherSuite::Aes128GcmSha256];
        let curves = [EllipticCurve::Secp384r1, EllipticCurve::Secp521r1];

        let unsigned =
            write_session_request_unsigned(&mut buf, 9, &hid, &suites, &curves).unwrap();
        let total =
            seal_handshake(&mut buf, HandshakeKind::SessionRequest, unsigned, b"signature")
                .unwrap();

        match parse(&buf[..total]).unwrap() {
            Message::SessionRequest(view) => {
                assert_eq!(view.session_number(), 9);
                assert_eq!(view.host_identifier(), &hid);
                assert_eq!(view.cipher_suites(), suites.to_vec());
                assert_eq!(view.elliptic_curves(), curves.to_vec());
                assert_eq!(view.signature(), b"signature");
                assert_eq!(view.unsigned_payload().len(), unsigned);
                assert_eq!(&view.unsigned_payload()[..4], &9u32.to_be_bytes());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let mut buf = [0u8; 512];
        let hid = [3u8; HOST_IDENTIFIER_SIZE];
        let public = [0x04u8; 97];

        let unsigned = write_session_unsigned(
            &mut buf,
            11,
            &hid,
            CipherSuite::Aes256GcmSha256,
            EllipticCurve::Secp384r1,
            &public,
        )
        .unwrap();
        let total = seal_handshake(&mut buf, HandshakeKind::Session, unsigned, b"sig").unwrap();

        match parse(&buf[..total]).unwrap() {
            Message::Session(view) => {
                assert_eq!(view.session_number(), 11);
                assert_eq!(view.host_identifier(), &hid);
                assert_eq!(view.cipher_suite(), Some(CipherSuite::Aes256GcmSha256));
                assert_eq!(view.elliptic_curve(), Some(EllipticCurve::Secp384r1));
                assert_eq!(view.public_key(), &public);
                assert_eq!(view.signature(), b"sig");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_session_rejects_nonzero_padding() {
        let mut buf = [0u8; 512];
        let hid = [0u8; HOST_IDENTIFIER_SIZE];
        let unsigned = write_session_unsigned(
            &mut buf,
            1,
            &hid,
            CipherSuite::Aes128GcmSha256,
            EllipticCurve::Secp521r1,
            &[0x04; 10],
        )
        .unwrap();
        let total = seal_handshake(&mut buf, HandshakeKind::Session, unsigned, b"s").unwrap();

        // Corrupt a padding byte.
        buf[HEADER_SIZE + 4 + HOST_IDENTIFIER_SIZE + 2] = 1;
        assert!(matches!(parse(&buf[..total]), Err(WireError::Malformed)));
    }

    #[test]
    fn test_data_roundtrip() {
        let mut buf = [0u8; 256];
        let total =
            write_data_frame(&mut buf, DataKind::Channel(0), 5, 7, b"PING").unwrap();
        set_data_tag(&mut buf, &[0xAA; TAG_SIZE]);

        match parse(&buf[..total]).unwrap() {
            Message::Data(view) => {
                assert_eq!(view.kind(), DataKind::Channel(0));
                assert_eq!(view.session_number(), 5);
                assert_eq!(view.sequence_number(), 7);
                assert_eq!(view.tag(), &[0xAA; TAG_SIZE]);
                assert_eq!(view.ciphertext(), b"PING");
                assert_eq!(view.aad(), &buf[..DATA_AAD_SIZE]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_data_channels_and_control_types() {
        let mut buf = [0u8; 128];
        for (kind, type_byte) in [
            (DataKind::Channel(0), 0x70),
            (DataKind::Channel(14), 0x7E),
            (DataKind::Channel(15), 0x7F),
            (DataKind::ContactRequest, 0xFD),
            (DataKind::Contact, 0xFE),
            (DataKind::KeepAlive, 0xFF),
        ] {
            let total = write_data_frame(&mut buf, kind, 1, 1, &[]).unwrap();
            assert_eq!(buf[1], type_byte);
            match parse(&buf[..total]).unwrap() {
                Message::Data(view) => assert_eq!(view.kind(), kind),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn test_control_kind_classification() {
        assert!(!DataKind::Channel(0).is_control());
        assert!(!DataKind::Channel(14).is_control());
        assert!(DataKind::Channel(15).is_control());
        assert!(DataKind::ContactRequest.is_control());
        assert!(DataKind::Contact.is_control());
        assert!(DataKind::KeepAlive.is_control());
    }

    #[test]
    fn test_reject_wrong_version() {
        let datagram = [0x02, 0x00, 0x00, 0x04, 0, 0, 0, 1];
        assert!(matches!(
            parse(&datagram),
            Err(WireError::UnknownVersion(0x02))
        ));
    }

    #[test]
    fn test_reject_unknown_type() {
        let datagram = [0x03, 0x42, 0x00, 0x00];
        assert!(matches!(parse(&datagram), Err(WireError::UnknownType(0x42))));
    }

    #[test]
    fn test_reject_length_mismatch() {
        // Declared length 4, actual body 3.
        let datagram = [0x03, 0x00, 0x00, 0x04, 0, 0, 1];
        assert!(matches!(
            parse(&datagram),
            Err(WireError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_reject_truncated_session_request() {
        let mut buf = [0u8; 512];
        let hid = [0u8; HOST_IDENTIFIER_SIZE];
        let unsigned = write_session_request_unsigned(
            &mut buf,
            1,
            &hid,
            &[CipherSuite::Aes128GcmSha256],
            &[EllipticCurve::Secp384r1],
        )
        .unwrap();
        let total =
            seal_handshake(&mut buf, HandshakeKind::SessionRequest, unsigned, b"sig").unwrap();

        // Lie about the cipher-suite capability length.
        let cs_len_at = HEADER_SIZE + 4 + HOST_IDENTIFIER_SIZE;
        buf[cs_len_at..cs_len_at + 2].copy_from_slice(&u16::MAX.to_be_bytes());
        assert!(parse(&buf[..total]).is_err());
    }

    #[test]
    fn test_reject_short_data() {
        let mut datagram = [0u8; DATA_PAYLOAD_OFFSET - 1];
        datagram[0] = PROTOCOL_VERSION;
        datagram[1] = 0x70;
        datagram[2..4]
            .copy_from_slice(&((DATA_PAYLOAD_OFFSET - 1 - HEADER_SIZE) as u16).to_be_bytes());
        assert!(parse(&datagram).is_err());
    }

    #[test]
    fn test_hash_list_roundtrip() {
        let hashes = vec![
            CertificateHash([1u8; 32]),
            CertificateHash([2u8; 32]),
            CertificateHash([3u8; 32]),
        ];
        let encoded = encode_hash_list(&hashes);
        assert_eq!(encoded.len(), 96);
        assert_eq!(parse_hash_list(&encoded).unwrap(), hashes);
    }

    #[test]
    fn test_hash_list_rejects_partial_hash() {
        assert!(parse_hash_list(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_contact_map_roundtrip() {
        let entries = vec![
            (
                CertificateHash([9u8; 32]),
                "198.51.100.7:12000".parse().unwrap(),
            ),
            (
                CertificateHash([8u8; 32]),
                "[fe80::a:0]:12001".parse().unwrap(),
            ),
        ];
        let encoded = encode_contact_map(&entries);
        assert_eq!(parse_contact_map(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_contact_map_entry_sizes() {
        let v4 = encode_contact_map(&[(
            CertificateHash([0u8; 32]),
            "1.2.3.4:5".parse().unwrap(),
        )]);
        assert_eq!(v4.len(), 32 + 1 + 4 + 2);
        assert_eq!(v4[32], 4);

        let v6 = encode_contact_map(&[(CertificateHash([0u8; 32]), "[::1]:5".parse().unwrap())]);
        assert_eq!(v6.len(), 32 + 1 + 16 + 2);
        assert_eq!(v6[32], 6);
    }

    #[test]
    fn test_contact_map_rejects_bad_family() {
        let mut encoded = encode_contact_map(&[(
            CertificateHash([0u8; 32]),
            "1.2.3.4:5".parse().unwrap(),
        )]);
        encoded[32] = 9;
        assert!(parse_contact_map(&encoded).is_err());
    }

    #[test]
    fn test_contact_map_rejects_truncated_entry() {
        let encoded = encode_contact_map(&[(
            CertificateHash([0u8; 32]),
            "1.2.3.4:5".parse().unwrap(),
        )]);
        assert!(parse_contact_map(&encoded[..encoded.len() - 1]).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
                let _ = parse(&data);
            }

            #[test]
            fn prop_hello_roundtrip(n in any::<u32>()) {
                let mut buf = [0u8; 16];
                let size = write_hello_request(&mut buf, n).unwrap();
                prop_assert_eq!(size, 8);
                match parse(&buf[..size]).unwrap() {
                    Message::HelloRequest { unique_number } => prop_assert_eq!(unique_number, n),
                    _ => prop_assert!(false),
                }
            }

            #[test]
            fn prop_data_roundtrip(
                session in any::<u32>(),
                sequence in any::<u32>(),
                channel in 0u8..16,
                payload in prop::collection::vec(any::<u8>(), 0..1400)
            ) {
                let mut buf = vec![0u8; DATA_PAYLOAD_OFFSET + payload.len()];
                let total = write_data_frame(
                    &mut buf,
                    DataKind::Channel(channel),
                    session,
                    sequence,
                    &payload,
                ).unwrap();
                prop_assert_eq!(total, buf.len());
                match parse(&buf[..total]).unwrap() {
                    Message::Data(view) => {
                        prop_assert_eq!(view.session_number(), session);
                        prop_assert_eq!(view.sequence_number(), sequence);
                        prop_assert_eq!(view.kind(), DataKind::Channel(channel));
                        prop_assert_eq!(view.ciphertext(), payload.as_slice());
                    }
                    _ => prop_assert!(false),
                }
            }

            #[test]
            fn prop_session_request_roundtrip(
                session in any::<u32>(),
                hid in any::<[u8; 32]>(),
                sig in prop::collection::vec(any::<u8>(), 1..512)
            ) {
                let mut buf = [0u8; 1024];
                let suites = [CipherSuite::Aes256GcmSha256];
                let curves = [EllipticCurve::Secp521r1];
                let unsigned = write_session_request_unsigned(
                    &mut buf, session, &hid, &suites, &curves,
                ).unwrap();
                let total = seal_handshake(
                    &mut buf, HandshakeKind::SessionRequest, unsigned, &sig,
                ).unwrap();
                match parse(&buf[..total]).unwrap() {
                    Message::SessionRequest(view) => {
                        prop_assert_eq!(view.session_number(), session);
                        prop_assert_eq!(view.host_identifier(), &hid);
                        prop_assert_eq!(view.signature(), sig.as_slice());
                    }
                    _ => prop_assert!(false),
                }
            }

            #[test]
            fn prop_contact_map_roundtrip(
                entries in prop::collection::vec(
                    (any::<[u8; 32]>(), any::<bool>(), any::<u32>(), any::<u16>()),
                    0..8,
                )
            ) {
                let entries: Vec<(CertificateHash, SocketAddr)> = entries
                    .into_iter()
                    .map(|(hash, v6, ip, port)| {
                        let addr: IpAddr = if v6 {
                            Ipv6Addr::from(u128::from(ip)).into()
                        } else {
                            Ipv4Addr::from(ip).into()
                        };
                        (CertificateHash(hash), SocketAddr::new(addr, port))
                    })
                    .collect();
                let encoded = encode_contact_map(&entries);
                prop_assert_eq!(parse_contact_map(&encoded).unwrap(), entries);
            }
        }
    }
}
