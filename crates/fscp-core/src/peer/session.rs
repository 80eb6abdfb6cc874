//! The per-peer finite state machine.
//!
//! Driven by parsed messages and explicit time. Handlers take the current
//! [`Instant`] and return [`Output`] commands; nothing here suspends, and
//! the endpoint serializes calls per peer, so ordering within a session
//! equals UDP arrival order.
//!
//! ```text
//! UNKNOWN ──send HELLO_REQUEST──▶ HELLO_SENT
//! HELLO_SENT ──recv HELLO_RESPONSE──▶ PRESENTED (after sending PRESENTATION)
//! UNKNOWN ──recv HELLO_REQUEST──▶ (reply; present) PRESENTED
//! PRESENTED ──recv PRESENTATION──▶ SESSION_REQUESTED (after sending SESSION_REQUEST)
//! SESSION_REQUESTED ──recv SESSION_REQUEST──▶ (send SESSION)
//!                   ──recv SESSION──▶ ESTABLISHED
//! ESTABLISHED ──rekey timer / sequence threshold──▶ REKEYING
//! REKEYING ──SESSIONs exchanged──▶ ESTABLISHED (keys promoted)
//! ```

use crate::config::EndpointConfig;
use crate::error::{SessionError, WireError};
use crate::events::{EndpointEvent, LossReason};
use crate::peer::replay::ReplayWindow;
use crate::peer::{MessageClass, Output};
use crate::pool::{MemoryPool, PooledBuffer, SharedBuffer};
use crate::wire::{
    self, DataKind, HandshakeKind, Message, CONTROL_CHANNEL, DATA_AAD_SIZE, DATA_PAYLOAD_OFFSET,
    DATA_TAG_OFFSET, HEADER_SIZE,
};
use fscp_crypto::{
    derive_session_material, random, Certificate, CertificateHash, CertificateValidator,
    CipherSuite, EllipticCurve, EphemeralKeyPair, Identity, OpeningKey, SealingKey,
    HOST_IDENTIFIER_SIZE,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Padding lengths for KEEP_ALIVE payloads; the spread hides whether an
/// idle tunnel carries anything at all.
const KEEP_ALIVE_PADDING: [usize; 4] = [16, 32, 64, 128];

/// Handshake state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Nothing exchanged yet
    Unknown,
    /// HELLO_REQUEST sent, awaiting the echo
    HelloSent,
    /// Identities exchanged (or being exchanged)
    Presented,
    /// SESSION_REQUEST sent, handshake in flight
    SessionRequested,
    /// Keys derived in both directions
    Established,
    /// Established, with a new handshake round in flight
    Rekeying,
}

/// Drop counters, one per failure class.
///
/// Cryptographic and format failures are never surfaced to the peer; they
/// are indistinguishable from loss. These counters and a DEBUG log line are
/// the only trace they leave.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerCounters {
    /// Malformed datagrams
    pub format_errors: u64,
    /// Bad signatures and AEAD authentication failures
    pub auth_failures: u64,
    /// Replayed sequence or session numbers
    pub replays: u64,
    /// DATA under a session number we hold no keys for
    pub session_mismatches: u64,
}

struct Retransmit {
    datagram: SharedBuffer,
    deadline: Instant,
    attempts: u32,
}

impl Retransmit {
    fn new(datagram: SharedBuffer, now: Instant, config: &EndpointConfig) -> Self {
        Self {
            datagram,
            deadline: now + config.retransmit.delay_for_attempt(0),
            attempts: 0,
        }
    }

    /// Advance the schedule; returns `None` when the attempts ran out.
    fn bump(&mut self, now: Instant, config: &EndpointConfig) -> Option<SharedBuffer> {
        self.attempts += 1;
        if self.attempts >= config.retransmit.max_attempts {
            return None;
        }
        self.deadline = now + config.retransmit.delay_for_attempt(self.attempts);
        Some(self.datagram.clone())
    }
}

struct HelloPending {
    rtx: Retransmit,
    started: Instant,
}

struct HandshakeRound {
    local_session_number: u32,
    ephemeral: Option<EphemeralKeyPair>,
    local_choice: Option<(CipherSuite, EllipticCurve)>,
    request_rtx: Option<Retransmit>,
    session_rtx: Option<Retransmit>,
    remote_session_number: Option<u32>,
    remote_cipher_suites: Vec<CipherSuite>,
    remote_elliptic_curves: Vec<EllipticCurve>,
    remote_choice: Option<(CipherSuite, EllipticCurve)>,
    remote_public: Option<Vec<u8>>,
}

impl HandshakeRound {
    fn new(local_session_number: u32) -> Self {
        Self {
            local_session_number,
            ephemeral: None,
            local_choice: None,
            request_rtx: None,
            session_rtx: None,
            remote_session_number: None,
            remote_cipher_suites: Vec::new(),
            remote_elliptic_curves: Vec::new(),
            remote_choice: None,
            remote_public: None,
        }
    }
}

struct ActiveSession {
    local_session_number: u32,
    remote_session_number: u32,
    cipher_suite: CipherSuite,
    elliptic_curve: EllipticCurve,
    seal: SealingKey,
    open: OpeningKey,
    local_sequence: u32,
    replay: ReplayWindow,
    established_at: Instant,
}

/// All protocol state for one remote peer
pub struct PeerSession {
    remote_addr: SocketAddr,
    config: Arc<EndpointConfig>,
    identity: Arc<Identity>,
    validator: Arc<dyn CertificateValidator>,
    pool: MemoryPool,
    local_host_identifier: [u8; HOST_IDENTIFIER_SIZE],

    state: PeerState,
    defunct: Option<LossReason>,
    remote_identity: Option<Certificate>,
    remote_host_identifier: Option<[u8; HOST_IDENTIFIER_SIZE]>,
    local_session_number: u32,
    committed_remote_session_number: Option<u32>,
    handshake: Option<HandshakeRound>,
    current: Option<ActiveSession>,
    previous: Option<ActiveSession>,
    presentation_sent: bool,
    re_presented: bool,
    presentation_rtx: Option<Retransmit>,
    last_session_datagram: Option<SharedBuffer>,
    pending_hellos: HashMap<u32, HelloPending>,
    pending_contact_hashes: HashSet<CertificateHash>,
    last_receive_at: Instant,
    last_send_at: Instant,
    counters: PeerCounters,
}

impl PeerSession {
    /// Create a session for a peer at `remote_addr`
    pub fn new(
        remote_addr: SocketAddr,
        config: Arc<EndpointConfig>,
        identity: Arc<Identity>,
        validator: Arc<dyn CertificateValidator>,
        pool: MemoryPool,
        local_host_identifier: [u8; HOST_IDENTIFIER_SIZE],
        now: Instant,
    ) -> Self {
        Self {
            remote_addr,
            config,
            identity,
            validator,
            pool,
            local_host_identifier,
            state: PeerState::Unknown,
            defunct: None,
            remote_identity: None,
            remote_host_identifier: None,
            local_session_number: 0,
            committed_remote_session_number: None,
            handshake: None,
            current: None,
            previous: None,
            presentation_sent: false,
            re_presented: false,
            presentation_rtx: None,
            last_session_datagram: None,
            pending_hellos: HashMap::new(),
            pending_contact_hashes: HashSet::new(),
            last_receive_at: now,
            last_send_at: now,
            counters: PeerCounters::default(),
        }
    }

    /// The peer's UDP address
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Drop counters
    #[must_use]
    pub fn counters(&self) -> PeerCounters {
        self.counters
    }

    /// Whether keys are derived in both directions
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.state, PeerState::Established | PeerState::Rekeying)
    }

    /// Why this session is dead, if it is
    #[must_use]
    pub fn defunct(&self) -> Option<LossReason> {
        self.defunct
    }

    /// Hash of the peer's certificate, once presented
    #[must_use]
    pub fn remote_certificate_hash(&self) -> Option<CertificateHash> {
        self.remote_identity.as_ref().map(Certificate::hash)
    }

    /// The negotiated cipher suite and curve of the current session
    #[must_use]
    pub fn current_algorithms(&self) -> Option<(CipherSuite, EllipticCurve)> {
        self.current
            .as_ref()
            .map(|session| (session.cipher_suite, session.elliptic_curve))
    }

    /// The session numbers (local, remote) of the current session
    #[must_use]
    pub fn current_session_numbers(&self) -> Option<(u32, u32)> {
        self.current
            .as_ref()
            .map(|session| (session.local_session_number, session.remote_session_number))
    }

    /// When the last message was accepted from this peer
    #[must_use]
    pub fn last_receive_at(&self) -> Instant {
        self.last_receive_at
    }

    /// Record that this peer asked for an introduction we could not serve
    pub fn remember_contact_interest(&mut self, hashes: impl IntoIterator<Item = CertificateHash>) {
        self.pending_contact_hashes.extend(hashes);
    }

    /// Consume a pending introduction interest for `hash`
    pub fn take_contact_interest(&mut self, hash: &CertificateHash) -> bool {
        self.pending_contact_hashes.remove(hash)
    }

    /// Start a hello exchange; returns the unique number for correlation.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session is defunct.
    pub fn greet(&mut self, now: Instant) -> Result<(u32, Vec<Output>), SessionError> {
        if self.defunct.is_some() {
            return Err(SessionError::Closed);
        }
        let unique_number = random::random_u32().map_err(|_| SessionError::InvalidState)?;
        let mut outputs = Vec::new();

        let Some(datagram) =
            self.build_control(|buf| wire::write_hello_request(buf, unique_number))
        else {
            return Err(SessionError::InvalidState);
        };
        self.pending_hellos.insert(
            unique_number,
            HelloPending {
                rtx: Retransmit::new(datagram.clone(), now, &self.config),
                started: now,
            },
        );
        if self.state == PeerState::Unknown {
            self.state = PeerState::HelloSent;
        }
        self.transmit_control(datagram, now, &mut outputs);
        Ok((unique_number, outputs))
    }

    /// Process one inbound datagram.
    ///
    /// Any failure is absorbed here: malformed or unauthentic datagrams are
    /// counted, logged at DEBUG and dropped, exactly as if the network had
    /// lost them.
    pub fn handle_datagram(&mut self, datagram: PooledBuffer, now: Instant) -> Vec<Output> {
        if self.defunct.is_some() {
            return Vec::new();
        }

        enum Parsed {
            HelloRequest(u32),
            HelloResponse(u32),
            Presentation(Vec<u8>),
            SessionRequest {
                session_number: u32,
                host_identifier: [u8; HOST_IDENTIFIER_SIZE],
                cipher_suites: Vec<CipherSuite>,
                elliptic_curves: Vec<EllipticCurve>,
                unsigned: Vec<u8>,
                signature: Vec<u8>,
            },
            Session {
                session_number: u32,
                host_identifier: [u8; HOST_IDENTIFIER_SIZE],
                cipher_suite: Option<CipherSuite>,
                elliptic_curve: Option<EllipticCurve>,
                public_key: Vec<u8>,
                unsigned: Vec<u8>,
                signature: Vec<u8>,
            },
            Data {
                kind: DataKind,
                session_number: u32,
                sequence_number: u32,
            },
        }

        let parsed = match wire::parse(datagram.as_slice()) {
            Ok(Message::HelloRequest { unique_number }) => Parsed::HelloRequest(unique_number),
            Ok(Message::HelloResponse { unique_number }) => Parsed::HelloResponse(unique_number),
            Ok(Message::Presentation(view)) => {
                Parsed::Presentation(view.certificate_der().to_vec())
            }
            Ok(Message::SessionRequest(view)) => Parsed::SessionRequest {
                session_number: view.session_number(),
                host_identifier: *view.host_identifier(),
                cipher_suites: view.cipher_suites(),
                elliptic_curves: view.elliptic_curves(),
                unsigned: view.unsigned_payload().to_vec(),
                signature: view.signature().to_vec(),
            },
            Ok(Message::Session(view)) => Parsed::Session {
                session_number: view.session_number(),
                host_identifier: *view.host_identifier(),
                cipher_suite: view.cipher_suite(),
                elliptic_curve: view.elliptic_curve(),
                public_key: view.public_key().to_vec(),
                unsigned: view.unsigned_payload().to_vec(),
                signature: view.signature().to_vec(),
            },
            Ok(Message::Data(view)) => Parsed::Data {
                kind: view.kind(),
                session_number: view.session_number(),
                sequence_number: view.sequence_number(),
            },
            Err(error) => {
                self.counters.format_errors += 1;
                tracing::debug!(peer = %self.remote_addr, code = "malformed", %error, "dropping datagram");
                return Vec::new();
            }
        };

        match parsed {
            Parsed::HelloRequest(unique_number) => self.on_hello_request(unique_number, now),
            Parsed::HelloResponse(unique_number) => self.on_hello_response(unique_number, now),
            Parsed::Presentation(der) => self.on_presentation(&der, now),
            Parsed::SessionRequest {
                session_number,
                host_identifier,
                cipher_suites,
                elliptic_curves,
                unsigned,
                signature,
            } => self.on_session_request(
                session_number,
                host_identifier,
                cipher_suites,
                elliptic_curves,
                &unsigned,
                &signature,
                now,
            ),
            Parsed::Session {
                session_number,
                host_identifier,
                cipher_suite,
                elliptic_curve,
                public_key,
                unsigned,
                signature,
            } => self.on_session(
                session_number,
                host_identifier,
                cipher_suite,
                elliptic_curve,
                public_key,
                &unsigned,
                &signature,
                now,
            ),
            Parsed::Data {
                kind,
                session_number,
                sequence_number,
            } => self.on_data(datagram, kind, session_number, sequence_number, now),
        }
    }

    /// Encrypt and queue a tap-side frame on `channel`
    pub fn send_frame(&mut self, frame: &[u8], channel: u8, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        if channel >= CONTROL_CHANNEL {
            tracing::debug!(channel, "refusing to send on a reserved channel");
            return outputs;
        }
        if self.defunct.is_some() || self.current.is_none() {
            return outputs;
        }
        if let Some(datagram) = self.seal_data(DataKind::Channel(channel), frame, now) {
            outputs.push(Output::Transmit {
                datagram,
                class: MessageClass::Data,
            });
        }
        // Checked after sealing so exactly `rekey_threshold` sequence
        // numbers ride each session; DATA keeps flowing under the old keys
        // until the new SESSIONs are exchanged.
        self.maybe_rekey(now, &mut outputs);
        outputs
    }

    /// Ask this peer to introduce the owners of `hashes`
    pub fn send_contact_request(
        &mut self,
        hashes: &[CertificateHash],
        now: Instant,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();
        if self.defunct.is_some() || self.current.is_none() || hashes.is_empty() {
            return outputs;
        }
        let plaintext = wire::encode_hash_list(hashes);
        if let Some(datagram) = self.seal_data(DataKind::ContactRequest, &plaintext, now) {
            outputs.push(Output::Transmit {
                datagram,
                class: MessageClass::Control,
            });
        }
        outputs
    }

    /// Answer a CONTACT_REQUEST with the endpoints we know
    pub fn send_contact_reply(
        &mut self,
        entries: &[(CertificateHash, SocketAddr)],
        now: Instant,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();
        if self.defunct.is_some() || self.current.is_none() || entries.is_empty() {
            return outputs;
        }
        let plaintext = wire::encode_contact_map(entries);
        if let Some(datagram) = self.seal_data(DataKind::Contact, &plaintext, now) {
            outputs.push(Output::Transmit {
                datagram,
                class: MessageClass::Control,
            });
        }
        outputs
    }

    /// Drive retransmissions, keep-alives, rekeys and timeouts
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        if self.defunct.is_some() {
            return outputs;
        }

        self.poll_hellos(now, &mut outputs);
        self.poll_handshake_retransmits(now, &mut outputs);
        if self.defunct.is_some() {
            return outputs;
        }

        // Session loss: silence past the timeout on an established link.
        if self.current.is_some()
            && now.duration_since(self.last_receive_at) >= self.config.session_timeout
        {
            tracing::info!(peer = %self.remote_addr, "session timed out");
            self.destroy(LossReason::Timeout, &mut outputs);
            return outputs;
        }

        self.maybe_rekey(now, &mut outputs);

        // Keep the link warm while idle.
        if self.current.is_some()
            && now.duration_since(self.last_send_at) >= self.config.keepalive_period
        {
            self.send_keep_alive(now, &mut outputs);
        }

        outputs
    }

    /// Tear the session down on endpoint shutdown
    pub fn close(&mut self) -> Vec<Output> {
        let mut outputs = Vec::new();
        if self.defunct.is_none() {
            self.destroy(LossReason::Closed, &mut outputs);
        }
        outputs
    }

    // ---- inbound handlers ----

    fn on_hello_request(&mut self, unique_number: u32, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        self.last_receive_at = now;

        if let Some(datagram) =
            self.build_control(|buf| wire::write_hello_response(buf, unique_number))
        {
            self.transmit_control(datagram, now, &mut outputs);
        }
        if self.state == PeerState::Unknown {
            self.send_presentation(now, &mut outputs);
            self.state = PeerState::Presented;
        }
        outputs
    }

    fn on_hello_response(&mut self, unique_number: u32, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();
        let Some(pending) = self.pending_hellos.remove(&unique_number) else {
            tracing::debug!(peer = %self.remote_addr, unique_number, "unexpected hello response");
            return outputs;
        };
        self.last_receive_at = now;
        let rtt = now.duration_since(pending.started);

        outputs.push(Output::HelloResult {
            unique_number,
            rtt: Some(rtt),
            success: true,
        });
        outputs.push(Output::Event(EndpointEvent::HelloCompleted {
            addr: self.remote_addr,
            rtt: Some(rtt),
            success: true,
        }));

        // The peer is alive; move on to the expensive part.
        if matches!(self.state, PeerState::Unknown | PeerState::HelloSent) {
            self.send_presentation(now, &mut outputs);
            self.state = PeerState::Presented;
        }
        outputs
    }

    fn on_presentation(&mut self, der: &[u8], now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();

        if self.identity.is_preshared() {
            // PSK links exchange empty presentations; there is no identity
            // to validate.
            if !der.is_empty() {
                self.counters.format_errors += 1;
                tracing::debug!(peer = %self.remote_addr, code = "unexpected_certificate", "dropping presentation");
                return outputs;
            }
        } else {
            let certificate = match Certificate::from_der(der) {
                Ok(certificate) => certificate,
                Err(error) => {
                    self.counters.format_errors += 1;
                    tracing::debug!(peer = %self.remote_addr, code = "bad_certificate", %error, "dropping presentation");
                    return outputs;
                }
            };
            if !self.validator.validate(&certificate) {
                tracing::warn!(
                    peer = %self.remote_addr,
                    certificate = %certificate.hash(),
                    "certificate rejected by validation policy"
                );
                self.destroy(LossReason::PolicyRejected, &mut outputs);
                return outputs;
            }
            if let Some(previous) = &self.remote_identity {
                if previous.hash() != certificate.hash() {
                    tracing::info!(peer = %self.remote_addr, "peer identity changed, discarding sessions");
                    self.reset_sessions();
                }
            }
            self.remote_identity = Some(certificate);
        }

        self.last_receive_at = now;
        self.presentation_rtx = None;

        if !self.presentation_sent {
            self.send_presentation(now, &mut outputs);
        } else if self.is_established() && self.handshake.is_none() && !self.re_presented {
            // A peer presenting against an established session has likely
            // restarted and lost our presentation; answer once, the
            // retransmit schedule covers losses.
            self.send_presentation(now, &mut outputs);
            self.re_presented = true;
        }
        if self.state == PeerState::Unknown || self.state == PeerState::HelloSent {
            self.state = PeerState::Presented;
        }
        // Identities are in hand; ask for a session unless one is already
        // established or being negotiated.
        if self.state == PeerState::Presented && self.handshake.is_none() && self.current.is_none()
        {
            self.start_handshake(now, &mut outputs);
        }
        outputs
    }

    #[allow(clippy::too_many_arguments)]
    fn on_session_request(
        &mut self,
        session_number: u32,
        host_identifier: [u8; HOST_IDENTIFIER_SIZE],
        cipher_suites: Vec<CipherSuite>,
        elliptic_curves: Vec<EllipticCurve>,
        unsigned: &[u8],
        signature: &[u8],
        now: Instant,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();

        if !self.verify_handshake_signature(unsigned, signature) {
            return outputs;
        }
        self.note_host_identifier(host_identifier);

        // Strictly increasing session numbers; anything at or below the
        // committed value is a replay, except the exact retransmission of
        // the round we just completed, which means our SESSION was lost.
        if let Some(committed) = self.committed_remote_session_number {
            if session_number == committed {
                if let Some(datagram) = self.last_session_datagram.clone() {
                    tracing::debug!(peer = %self.remote_addr, "re-answering retransmitted session request");
                    self.transmit_control(datagram, now, &mut outputs);
                    return outputs;
                }
            }
            if session_number <= committed {
                self.counters.replays += 1;
                tracing::debug!(peer = %self.remote_addr, code = "replay", session_number, "stale session request");
                return outputs;
            }
        }

        if let Some(round) = &self.handshake {
            if let Some(known) = round.remote_session_number {
                if session_number < known {
                    tracing::debug!(peer = %self.remote_addr, code = "replay", session_number, "superseded session request");
                    return outputs;
                }
                if session_number == known {
                    // A retransmission; our own SESSION retransmit timer
                    // answers it.
                    return outputs;
                }
            }
        }

        self.last_receive_at = now;
        self.presentation_rtx = None;

        // Make sure a round exists and carries our own request.
        if self.handshake.is_none() {
            let minted = self.mint_session_number(Some(session_number));
            self.handshake = Some(HandshakeRound::new(minted));
        }
        let round = self.handshake.as_mut().expect("round created above");
        round.remote_session_number = Some(session_number);
        round.remote_cipher_suites = cipher_suites;
        round.remote_elliptic_curves = elliptic_curves;
        // A newer request from the peer invalidates any SESSION we built
        // for an earlier one.
        round.remote_choice = None;
        round.remote_public = None;
        round.session_rtx = None;

        if round.request_rtx.is_none() {
            self.send_session_request(now, &mut outputs);
        }

        // With both capability sets on the table the choice is canonical on
        // both sides: the higher session number (host identifier breaking
        // ties) picks first out of its own preference order.
        let negotiated = {
            let round = self.handshake.as_ref().expect("round exists");
            negotiate(
                (
                    round.local_session_number,
                    &self.local_host_identifier,
                    self.config.cipher_suites.as_slice(),
                    self.config.elliptic_curves.as_slice(),
                ),
                (
                    session_number,
                    self.remote_host_identifier
                        .as_ref()
                        .expect("stored by note_host_identifier"),
                    round.remote_cipher_suites.as_slice(),
                    round.remote_elliptic_curves.as_slice(),
                ),
            )
        };
        let (suite, curve) = match negotiated {
            Ok(choice) => choice,
            Err(error) => {
                tracing::warn!(peer = %self.remote_addr, %error, "no usable algorithm intersection");
                self.destroy(LossReason::PolicyRejected, &mut outputs);
                return outputs;
            }
        };

        let regenerate = match self.handshake.as_ref() {
            Some(round) => match (&round.ephemeral, round.local_choice) {
                (Some(_), Some(previous)) => previous != (suite, curve),
                _ => true,
            },
            None => true,
        };
        if regenerate {
            let keypair = match EphemeralKeyPair::generate(curve) {
                Ok(keypair) => keypair,
                Err(error) => {
                    tracing::warn!(peer = %self.remote_addr, %error, "cannot honour negotiated curve");
                    self.destroy(LossReason::PolicyRejected, &mut outputs);
                    return outputs;
                }
            };
            let round = self.handshake.as_mut().expect("round exists");
            round.ephemeral = Some(keypair);
            round.local_choice = Some((suite, curve));
        }

        self.send_session(now, &mut outputs);
        if !self.is_established() && self.state != PeerState::SessionRequested {
            self.state = PeerState::SessionRequested;
        }
        self.try_complete(now, &mut outputs);
        outputs
    }

    #[allow(clippy::too_many_arguments)]
    fn on_session(
        &mut self,
        session_number: u32,
        host_identifier: [u8; HOST_IDENTIFIER_SIZE],
        cipher_suite: Option<CipherSuite>,
        elliptic_curve: Option<EllipticCurve>,
        public_key: Vec<u8>,
        unsigned: &[u8],
        signature: &[u8],
        now: Instant,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();

        if !self.verify_handshake_signature(unsigned, signature) {
            return outputs;
        }
        self.note_host_identifier(host_identifier);

        // A SESSION at or below the committed remote session number must
        // not disturb the established session. An exact retransmission of
        // the committed round means the peer never saw our SESSION.
        if let Some(committed) = self.committed_remote_session_number {
            if session_number == committed {
                if let Some(datagram) = self.last_session_datagram.clone() {
                    tracing::debug!(peer = %self.remote_addr, "re-answering retransmitted session");
                    self.transmit_control(datagram, now, &mut outputs);
                    return outputs;
                }
            }
            if session_number <= committed {
                self.counters.replays += 1;
                tracing::debug!(peer = %self.remote_addr, code = "replay", session_number, "stale session message");
                return outputs;
            }
        }
        let Some(round) = self.handshake.as_mut() else {
            tracing::debug!(peer = %self.remote_addr, code = "unexpected_session", "no handshake in progress");
            return outputs;
        };
        match round.remote_session_number {
            Some(known) if session_number < known => {
                tracing::debug!(peer = %self.remote_addr, code = "replay", session_number, "superseded session message");
                return outputs;
            }
            _ => round.remote_session_number = Some(session_number),
        }

        let (Some(suite), Some(curve)) = (cipher_suite, elliptic_curve) else {
            tracing::warn!(peer = %self.remote_addr, "peer chose an unknown algorithm");
            self.destroy(LossReason::PolicyRejected, &mut outputs);
            return outputs;
        };
        // The peer's choice must be within what we advertised.
        if !self.config.cipher_suites.contains(&suite)
            || !self.config.elliptic_curves.contains(&curve)
        {
            tracing::warn!(
                peer = %self.remote_addr,
                suite = suite.name(),
                curve = curve.name(),
                "peer chose outside our advertised capabilities"
            );
            self.destroy(LossReason::PolicyRejected, &mut outputs);
            return outputs;
        }

        self.last_receive_at = now;
        self.presentation_rtx = None;
        let round = self.handshake.as_mut().expect("checked above");
        round.remote_choice = Some((suite, curve));
        round.remote_public = Some(public_key);
        // Their SESSION proves our SESSION_REQUEST arrived.
        round.request_rtx = None;

        self.try_complete(now, &mut outputs);
        outputs
    }

    fn on_data(
        &mut self,
        mut datagram: PooledBuffer,
        kind: DataKind,
        session_number: u32,
        sequence_number: u32,
        now: Instant,
    ) -> Vec<Output> {
        let mut outputs = Vec::new();

        let matched_current = match &self.current {
            Some(session) if session.remote_session_number == session_number => true,
            _ => match &self.previous {
                Some(session) if session.remote_session_number == session_number => false,
                _ => {
                    self.counters.session_mismatches += 1;
                    tracing::debug!(
                        peer = %self.remote_addr,
                        code = "unexpected_session_number",
                        session_number,
                        "dropping data"
                    );
                    return outputs;
                }
            },
        };

        let session = if matched_current {
            self.current.as_mut().expect("matched current")
        } else {
            self.previous.as_mut().expect("matched previous")
        };

        if !session.replay.check(sequence_number) {
            self.counters.replays += 1;
            tracing::debug!(peer = %self.remote_addr, code = "replay", sequence_number, "dropping data");
            return outputs;
        }

        let block = datagram.as_mut_slice();
        let (head, payload) = block.split_at_mut(DATA_PAYLOAD_OFFSET);
        if session
            .open
            .open_in_place(sequence_number, &head[..DATA_AAD_SIZE], payload, &head[DATA_TAG_OFFSET..])
            .is_err()
        {
            self.counters.auth_failures += 1;
            tracing::debug!(peer = %self.remote_addr, code = "decrypt_failed", sequence_number, "dropping data");
            return outputs;
        }
        session.replay.commit(sequence_number);

        // First authenticated datagram under the newer session retires the
        // older key set.
        if matched_current && self.previous.is_some() {
            self.previous = None;
        }
        self.last_receive_at = now;
        // Authenticated traffic is all the progress a pending presentation
        // retransmit was waiting for.
        self.presentation_rtx = None;

        match kind {
            DataKind::Channel(channel) if channel < CONTROL_CHANNEL => {
                outputs.push(Output::Deliver { channel, datagram });
            }
            DataKind::Channel(channel) => {
                tracing::debug!(peer = %self.remote_addr, channel, "dropping frame on reserved channel");
            }
            DataKind::KeepAlive => {
                // Nothing to do; receipt already refreshed the timers.
            }
            DataKind::ContactRequest => {
                match wire::parse_hash_list(&datagram.as_slice()[DATA_PAYLOAD_OFFSET..]) {
                    Ok(hashes) if !hashes.is_empty() => {
                        outputs.push(Output::ContactLookup(hashes));
                    }
                    Ok(_) => {}
                    Err(error) => {
                        self.counters.format_errors += 1;
                        tracing::debug!(peer = %self.remote_addr, code = "malformed", %error, "bad contact request");
                    }
                }
            }
            DataKind::Contact => {
                match wire::parse_contact_map(&datagram.as_slice()[DATA_PAYLOAD_OFFSET..]) {
                    Ok(entries) => {
                        for (hash, addr) in entries {
                            outputs.push(Output::Event(EndpointEvent::ContactReceived {
                                hash,
                                addr,
                            }));
                            outputs.push(Output::GreetAddress(addr));
                        }
                    }
                    Err(error) => {
                        self.counters.format_errors += 1;
                        tracing::debug!(peer = %self.remote_addr, code = "malformed", %error, "bad contact message");
                    }
                }
            }
        }
        outputs
    }

    // ---- handshake internals ----

    fn verify_handshake_signature(&mut self, unsigned: &[u8], signature: &[u8]) -> bool {
        let verifier = match self.identity.verifier_for(self.remote_identity.as_ref()) {
            Ok(verifier) => verifier,
            Err(_) => {
                self.counters.auth_failures += 1;
                tracing::debug!(peer = %self.remote_addr, code = "no_identity", "handshake before presentation");
                return false;
            }
        };
        if verifier.verify(unsigned, signature).is_err() {
            self.counters.auth_failures += 1;
            tracing::debug!(peer = %self.remote_addr, code = "bad_signature", "dropping handshake message");
            return false;
        }
        true
    }

    /// Detect peer restarts: a changed host identifier discards every key
    /// and restarts the handshake from scratch.
    fn note_host_identifier(&mut self, host_identifier: [u8; HOST_IDENTIFIER_SIZE]) {
        match &self.remote_host_identifier {
            Some(known) if *known != host_identifier => {
                tracing::info!(peer = %self.remote_addr, "peer restarted, discarding prior sessions");
                self.reset_sessions();
                self.remote_host_identifier = Some(host_identifier);
            }
            Some(_) => {}
            None => self.remote_host_identifier = Some(host_identifier),
        }
    }

    fn reset_sessions(&mut self) {
        self.current = None;
        self.previous = None;
        self.handshake = None;
        self.last_session_datagram = None;
        self.committed_remote_session_number = None;
        if self.is_established() {
            self.state = PeerState::Presented;
        }
    }

    fn mint_session_number(&self, observed_remote: Option<u32>) -> u32 {
        let floor = self
            .local_session_number
            .max(observed_remote.unwrap_or(0))
            .max(self.committed_remote_session_number.unwrap_or(0));
        floor + 1
    }

    fn start_handshake(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let minted = self.mint_session_number(None);
        self.handshake = Some(HandshakeRound::new(minted));
        self.send_session_request(now, outputs);
        if !self.is_established() {
            self.state = PeerState::SessionRequested;
        }
    }

    fn maybe_rekey(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        if self.handshake.is_some() || self.defunct.is_some() {
            return;
        }
        let Some(session) = &self.current else {
            return;
        };
        let by_sequence = session.local_sequence >= self.config.rekey_threshold;
        let by_age =
            now.duration_since(session.established_at) >= self.config.max_session_age;
        if !by_sequence && !by_age {
            return;
        }
        tracing::debug!(
            peer = %self.remote_addr,
            by_sequence,
            by_age,
            "initiating rekey"
        );
        let minted = self.mint_session_number(Some(session.remote_session_number));
        self.handshake = Some(HandshakeRound::new(minted));
        self.send_session_request(now, outputs);
        self.state = PeerState::Rekeying;
    }

    fn send_presentation(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let der = self
            .identity
            .certificate()
            .map(|certificate| certificate.der().to_vec())
            .unwrap_or_default();
        let Some(datagram) = self.build_control(|buf| wire::write_presentation(buf, &der)) else {
            return;
        };
        self.presentation_sent = true;
        self.presentation_rtx = Some(Retransmit::new(datagram.clone(), now, &self.config));
        self.transmit_control(datagram, now, outputs);
    }

    fn send_session_request(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let Some(round) = self.handshake.as_ref() else {
            return;
        };
        let session_number = round.local_session_number;
        let host_identifier = self.local_host_identifier;
        let suites = self.config.cipher_suites.clone();
        let curves = self.config.elliptic_curves.clone();
        let identity = Arc::clone(&self.identity);

        let datagram = self.build_control(|buf| {
            let unsigned = wire::write_session_request_unsigned(
                buf,
                session_number,
                &host_identifier,
                &suites,
                &curves,
            )?;
            let signature = identity
                .sign(&buf[HEADER_SIZE..HEADER_SIZE + unsigned])
                .map_err(|_| WireError::Malformed)?;
            wire::seal_handshake(buf, HandshakeKind::SessionRequest, unsigned, &signature)
        });
        let Some(datagram) = datagram else { return };

        self.local_session_number = session_number;
        if let Some(round) = self.handshake.as_mut() {
            round.request_rtx = Some(Retransmit::new(datagram.clone(), now, &self.config));
        }
        self.transmit_control(datagram, now, outputs);
    }

    fn send_session(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let Some(round) = self.handshake.as_ref() else {
            return;
        };
        let (Some((suite, curve)), Some(ephemeral)) = (round.local_choice, &round.ephemeral)
        else {
            return;
        };
        let session_number = round.local_session_number;
        let host_identifier = self.local_host_identifier;
        let public_key = ephemeral.public_bytes().to_vec();
        let identity = Arc::clone(&self.identity);

        let datagram = self.build_control(|buf| {
            let unsigned = wire::write_session_unsigned(
                buf,
                session_number,
                &host_identifier,
                suite,
                curve,
                &public_key,
            )?;
            let signature = identity
                .sign(&buf[HEADER_SIZE..HEADER_SIZE + unsigned])
                .map_err(|_| WireError::Malformed)?;
            wire::seal_handshake(buf, HandshakeKind::Session, unsigned, &signature)
        });
        let Some(datagram) = datagram else { return };

        if let Some(round) = self.handshake.as_mut() {
            round.session_rtx = Some(Retransmit::new(datagram.clone(), now, &self.config));
        }
        self.transmit_control(datagram, now, outputs);
    }

    /// Promote the round to an active session once both SESSIONs are out
    /// and verified.
    fn try_complete(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let ready = match self.handshake.as_ref() {
            Some(round) => {
                round.session_rtx.is_some()
                    && round.remote_public.is_some()
                    && round.remote_choice.is_some()
                    && round.remote_session_number.is_some()
                    && round.ephemeral.is_some()
            }
            None => false,
        };
        if !ready {
            return;
        }
        let mut round = self.handshake.take().expect("checked ready");

        let local_choice = round.local_choice.expect("set alongside ephemeral");
        let remote_choice = round.remote_choice.expect("checked ready");
        if local_choice != remote_choice {
            tracing::warn!(
                peer = %self.remote_addr,
                "negotiation disagreement: ours {:?}, theirs {:?}",
                local_choice,
                remote_choice
            );
            self.destroy(LossReason::PolicyRejected, outputs);
            return;
        }
        let (suite, curve) = local_choice;

        let ephemeral = round.ephemeral.take().expect("checked ready");
        let remote_public = round.remote_public.take().expect("checked ready");
        let local_session_number = round.local_session_number;
        let remote_session_number = round.remote_session_number.expect("checked ready");

        let shared = match ephemeral.agree(&remote_public) {
            Ok(shared) => shared,
            Err(error) => {
                self.counters.auth_failures += 1;
                tracing::debug!(peer = %self.remote_addr, code = "bad_public_key", %error, "handshake failed");
                return;
            }
        };
        let remote_host_identifier = self
            .remote_host_identifier
            .expect("set before any SESSION verifies");

        let material = match derive_session_material(
            &shared,
            suite,
            local_session_number,
            remote_session_number,
            &self.local_host_identifier,
            &remote_host_identifier,
        ) {
            Ok(material) => material,
            Err(error) => {
                tracing::debug!(peer = %self.remote_addr, code = "kdf_failed", %error, "handshake failed");
                return;
            }
        };

        let seal = SealingKey::new(suite, &material.local_key, material.nonce_prefix_local);
        let open = OpeningKey::new(suite, &material.remote_key, material.nonce_prefix_remote);
        let (Ok(seal), Ok(open)) = (seal, open) else {
            tracing::debug!(peer = %self.remote_addr, code = "key_setup_failed", "handshake failed");
            return;
        };

        let was_established = self.is_established();
        // Outbound switches to the new keys immediately; the old opening
        // keys stay alive until the peer sends DATA under the new number.
        self.previous = self.current.take();
        self.current = Some(ActiveSession {
            local_session_number,
            remote_session_number,
            cipher_suite: suite,
            elliptic_curve: curve,
            seal,
            open,
            local_sequence: 0,
            replay: ReplayWindow::new(),
            established_at: now,
        });
        self.committed_remote_session_number = Some(remote_session_number);
        // Kept so a peer whose copy of our SESSION was lost can be answered
        // when it retransmits its handshake.
        self.last_session_datagram = round.session_rtx.take().map(|rtx| rtx.datagram);
        self.re_presented = false;
        self.state = PeerState::Established;

        tracing::info!(
            peer = %self.remote_addr,
            suite = suite.name(),
            curve = curve.name(),
            session = local_session_number,
            rekey = was_established,
            "session established"
        );
        if !was_established {
            outputs.push(Output::Event(EndpointEvent::PeerEstablished {
                addr: self.remote_addr,
                certificate_hash: self.remote_certificate_hash(),
            }));
        }
    }

    // ---- timers ----

    fn poll_hellos(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let mut resend = Vec::new();
        let mut failed = Vec::new();
        for (&unique_number, pending) in &mut self.pending_hellos {
            if now < pending.rtx.deadline {
                continue;
            }
            match pending.rtx.bump(now, &self.config) {
                Some(datagram) => resend.push(datagram),
                None => failed.push(unique_number),
            }
        }
        for datagram in resend {
            self.transmit_control(datagram, now, outputs);
        }
        for unique_number in failed {
            self.pending_hellos.remove(&unique_number);
            tracing::debug!(peer = %self.remote_addr, unique_number, "hello ran out of attempts");
            outputs.push(Output::HelloResult {
                unique_number,
                rtt: None,
                success: false,
            });
            outputs.push(Output::Event(EndpointEvent::HelloCompleted {
                addr: self.remote_addr,
                rtt: None,
                success: false,
            }));
            if self.state == PeerState::HelloSent {
                self.state = PeerState::Unknown;
            }
        }
        // A peer that never answers any probe and holds no session is gone.
        if self.pending_hellos.is_empty()
            && self.state == PeerState::Unknown
            && self.current.is_none()
            && self.handshake.is_none()
            && outputs
                .iter()
                .any(|output| matches!(output, Output::HelloResult { success: false, .. }))
        {
            self.destroy(LossReason::Unreachable, outputs);
        }
    }

    fn poll_handshake_retransmits(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let mut exhausted = false;
        let mut resend = Vec::new();

        if let Some(rtx) = self.presentation_rtx.as_mut() {
            if now >= rtx.deadline {
                match rtx.bump(now, &self.config) {
                    Some(datagram) => resend.push(datagram),
                    None => exhausted = true,
                }
            }
        }
        if let Some(round) = self.handshake.as_mut() {
            for rtx in [round.request_rtx.as_mut(), round.session_rtx.as_mut()]
                .into_iter()
                .flatten()
            {
                if now >= rtx.deadline {
                    match rtx.bump(now, &self.config) {
                        Some(datagram) => resend.push(datagram),
                        None => exhausted = true,
                    }
                }
            }
        }

        if exhausted {
            tracing::info!(peer = %self.remote_addr, "handshake retransmissions exhausted");
            self.destroy(LossReason::Unreachable, outputs);
            return;
        }
        for datagram in resend {
            self.transmit_control(datagram, now, outputs);
        }
    }

    fn send_keep_alive(&mut self, now: Instant, outputs: &mut Vec<Output>) {
        let mut padding = [0u8; 128];
        let index = match random::random_u32() {
            Ok(value) => value as usize % KEEP_ALIVE_PADDING.len(),
            Err(_) => 0,
        };
        let len = KEEP_ALIVE_PADDING[index];
        if random::fill_random(&mut padding[..len]).is_err() {
            return;
        }
        if let Some(datagram) = self.seal_data(DataKind::KeepAlive, &padding[..len], now) {
            outputs.push(Output::Transmit {
                datagram,
                class: MessageClass::Data,
            });
        }
    }

    // ---- plumbing ----

    fn destroy(&mut self, reason: LossReason, outputs: &mut Vec<Output>) {
        self.defunct = Some(reason);
        self.current = None;
        self.previous = None;
        self.handshake = None;
        self.presentation_rtx = None;
        for (unique_number, _) in self.pending_hellos.drain() {
            outputs.push(Output::HelloResult {
                unique_number,
                rtt: None,
                success: false,
            });
        }
        outputs.push(Output::Event(EndpointEvent::PeerLost {
            addr: self.remote_addr,
            reason,
        }));
    }

    fn build_control(
        &mut self,
        build: impl FnOnce(&mut [u8]) -> Result<usize, WireError>,
    ) -> Option<SharedBuffer> {
        let mut buffer = match self.pool.allocate() {
            Ok(buffer) => buffer,
            Err(error) => {
                tracing::warn!(peer = %self.remote_addr, %error, "no buffer for control message");
                return None;
            }
        };
        let len = match build(buffer.block_mut()) {
            Ok(len) => len,
            Err(error) => {
                tracing::debug!(peer = %self.remote_addr, %error, "failed to encode message");
                return None;
            }
        };
        buffer.set_len(len);
        Some(buffer.freeze())
    }

    fn transmit_control(
        &mut self,
        datagram: SharedBuffer,
        now: Instant,
        outputs: &mut Vec<Output>,
    ) {
        self.last_send_at = now;
        outputs.push(Output::Transmit {
            datagram,
            class: MessageClass::Control,
        });
    }

    fn seal_data(
        &mut self,
        kind: DataKind,
        plaintext: &[u8],
        now: Instant,
    ) -> Option<SharedBuffer> {
        let session = self.current.as_mut()?;
        assert!(
            session.local_sequence != u32::MAX,
            "sequence number space exhausted without rekey"
        );

        let mut buffer = match self.pool.allocate() {
            Ok(buffer) => buffer,
            Err(error) => {
                tracing::warn!(peer = %self.remote_addr, %error, "no buffer for data message");
                return None;
            }
        };
        let block = buffer.block_mut();
        let total = match wire::write_data_frame(
            block,
            kind,
            session.local_session_number,
            session.local_sequence,
            plaintext,
        ) {
            Ok(total) => total,
            Err(error) => {
                tracing::debug!(peer = %self.remote_addr, %error, "failed to encode data message");
                return None;
            }
        };

        let (head, payload) = block[..total].split_at_mut(DATA_PAYLOAD_OFFSET);
        let tag = match session.seal.seal_in_place(
            session.local_sequence,
            &head[..DATA_AAD_SIZE],
            payload,
        ) {
            Ok(tag) => tag,
            Err(error) => {
                tracing::warn!(peer = %self.remote_addr, %error, "encryption failed");
                return None;
            }
        };
        head[DATA_TAG_OFFSET..].copy_from_slice(&tag);

        session.local_sequence += 1;
        self.last_send_at = now;
        buffer.set_len(total);
        Some(buffer.freeze())
    }
}

fn negotiate(
    local: (u32, &[u8; HOST_IDENTIFIER_SIZE], &[CipherSuite], &[EllipticCurve]),
    remote: (u32, &[u8; HOST_IDENTIFIER_SIZE], &[CipherSuite], &[EllipticCurve]),
) -> Result<(CipherSuite, EllipticCurve), SessionError> {
    let (local_sn, local_hid, local_cs, local_ec) = local;
    let (remote_sn, remote_hid, remote_cs, remote_ec) = remote;
    let local_wins = (local_sn, local_hid) > (remote_sn, remote_hid);

    let (winner_cs, winner_ec, loser_cs, loser_ec) = if local_wins {
        (local_cs, local_ec, remote_cs, remote_ec)
    } else {
        (remote_cs, remote_ec, local_cs, local_ec)
    };

    let suite = winner_cs
        .iter()
        .copied()
        .find(|suite| loser_cs.contains(suite))
        .ok_or(SessionError::NoCommonAlgorithm("cipher suite"))?;
    let curve = winner_ec
        .iter()
        .copied()
        .find(|curve| loser_ec.contains(curve))
        .ok_or(SessionError::NoCommonAlgorithm("elliptic curve"))?;
    Ok((suite, curve))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use fscp_crypto::PresharedKey;

    fn test_session(hid_byte: u8) -> PeerSession {
        let config = Arc::new(EndpointConfig::default());
        let identity = Arc::new(Identity::from_preshared(PresharedKey::new(
            b"unit test key".to_vec(),
        )));
        let validator: Arc<dyn CertificateValidator> =
            Arc::new(fscp_crypto::ValidationPolicy::None);
        PeerSession::new(
            "192.0.2.1:12000".parse().unwrap(),
            config,
            identity,
            validator,
            MemoryPool::new(PoolConfig::default()),
            [hid_byte; HOST_IDENTIFIER_SIZE],
            Instant::now(),
        )
    }

    fn transmits(outputs: &[Output]) -> Vec<&SharedBuffer> {
        outputs
            .iter()
            .filter_map(|output| match output {
                Output::Transmit { datagram, .. } => Some(datagram),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_greet_sends_hello_and_tracks_state() {
        let mut session = test_session(1);
        let now = Instant::now();
        let (unique, outputs) = session.greet(now).unwrap();

        assert_eq!(session.state(), PeerState::HelloSent);
        let sent = transmits(&outputs);
        assert_eq!(sent.len(), 1);
        // Header: version 3, type HELLO_REQUEST, length 4, then the number.
        let bytes = sent[0].as_slice();
        assert_eq!(&bytes[..4], &[0x03, 0x00, 0x00, 0x04]);
        assert_eq!(&bytes[4..8], &unique.to_be_bytes());
    }

    #[test]
    fn test_hello_request_is_echoed() {
        let mut session = test_session(1);
        let now = Instant::now();

        let pool = MemoryPool::default();
        let mut datagram = pool.allocate().unwrap();
        let len = wire::write_hello_request(datagram.block_mut(), 0x01020304).unwrap();
        datagram.set_len(len);

        let outputs = session.handle_datagram(datagram, now);
        let sent = transmits(&outputs);
        assert!(!sent.is_empty());
        assert_eq!(
            &sent[0].as_slice()[..8],
            &[0x03, 0x01, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
        // An inbound hello from an unknown peer also triggers presentation.
        assert_eq!(session.state(), PeerState::Presented);
    }

    #[test]
    fn test_malformed_datagram_counted_and_dropped() {
        let mut session = test_session(1);
        let pool = MemoryPool::default();
        let mut datagram = pool.allocate().unwrap();
        datagram.copy_from(&[0xFFu8; 10]);

        let outputs = session.handle_datagram(datagram, Instant::now());
        assert!(outputs.is_empty());
        assert_eq!(session.counters().format_errors, 1);
        assert_eq!(session.state(), PeerState::Unknown);
    }

    #[test]
    fn test_hello_retransmit_then_give_up() {
        let mut session = test_session(1);
        let start = Instant::now();
        let (_, _) = session.greet(start).unwrap();

        let mut at = start;
        let mut resends = 0;
        let mut completed = false;
        // Walk far past the full backoff schedule.
        for _ in 0..12 {
            at += std::time::Duration::from_secs(31);
            for output in session.poll_timers(at) {
                match output {
                    Output::Transmit { .. } => resends += 1,
                    Output::HelloResult { success, .. } => {
                        assert!(!success);
                        completed = true;
                    }
                    _ => {}
                }
            }
        }
        assert!(completed);
        // max_attempts = 5 means four retransmissions before giving up.
        assert_eq!(resends, 4);
        // Nothing else pending: the peer is reaped.
        assert_eq!(session.defunct(), Some(LossReason::Unreachable));
    }

    #[test]
    fn test_send_frame_without_session_drops() {
        let mut session = test_session(1);
        let outputs = session.send_frame(b"frame", 0, Instant::now());
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_reserved_channel_refused() {
        let mut session = test_session(1);
        let outputs = session.send_frame(b"frame", 15, Instant::now());
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_negotiate_winner_preference() {
        let hid_a = [1u8; HOST_IDENTIFIER_SIZE];
        let hid_b = [2u8; HOST_IDENTIFIER_SIZE];
        let cs_a = [CipherSuite::Aes128GcmSha256, CipherSuite::Aes256GcmSha256];
        let cs_b = [CipherSuite::Aes256GcmSha256, CipherSuite::Aes128GcmSha256];
        let ec = [EllipticCurve::Secp384r1];

        // B has the higher session number, so B's preference leads.
        let choice =
            negotiate((1, &hid_a, &cs_a[..], &ec[..]), (2, &hid_b, &cs_b[..], &ec[..])).unwrap();
        assert_eq!(choice.0, CipherSuite::Aes256GcmSha256);

        // Tie on session number: the larger host identifier wins.
        let choice =
            negotiate((2, &hid_a, &cs_a[..], &ec[..]), (2, &hid_b, &cs_b[..], &ec[..])).unwrap();
        assert_eq!(choice.0, CipherSuite::Aes256GcmSha256);

        // Symmetric from the other side.
        let choice =
            negotiate((2, &hid_b, &cs_b[..], &ec[..]), (2, &hid_a, &cs_a[..], &ec[..])).unwrap();
        assert_eq!(choice.0, CipherSuite::Aes256GcmSha256);
    }

    #[test]
    fn test_negotiate_empty_intersection() {
        let hid_a = [1u8; HOST_IDENTIFIER_SIZE];
        let hid_b = [2u8; HOST_IDENTIFIER_SIZE];
        let result = negotiate(
            (
                1,
                &hid_a,
                &[CipherSuite::Aes128GcmSha256][..],
                &[EllipticCurve::Secp384r1][..],
            ),
            (
                2,
                &hid_b,
                &[CipherSuite::Aes256GcmSha256][..],
                &[EllipticCurve::Secp384r1][..],
            ),
        );
        assert!(matches!(result, Err(SessionError::NoCommonAlgorithm(_))));
    }

    #[test]
    fn test_close_reports_loss() {
        let mut session = test_session(1);
        let outputs = session.close();
        assert!(outputs.iter().any(|output| matches!(
            output,
            Output::Event(EndpointEvent::PeerLost {
                reason: LossReason::Closed,
                ..
            })
        )));
        assert_eq!(session.defunct(), Some(LossReason::Closed));
    }
}
