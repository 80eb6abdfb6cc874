//! Protocol scenarios driven over a deterministic in-memory wire.

use fscp_core::wire::{self, HandshakeKind, Message};
use fscp_core::{EndpointConfig, EndpointEvent, LossReason, Output, PeerState};
use fscp_crypto::{CertificateHash, CipherSuite, EllipticCurve, Identity, PresharedKey};
use fscp_integration_tests::{delivered_frames, transmitted, Harness};
use std::sync::Arc;
use std::time::Duration;

fn config() -> EndpointConfig {
    EndpointConfig::default()
}

/// S1: the hello round trip, byte for byte.
#[test]
fn hello_round_trip_bytes() {
    let harness = Harness::new();
    let mut b = harness.session("192.0.2.1:12000", 2, config());

    let request = [0x03, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04];
    let outputs = harness.deliver(&mut b, &request);
    let sent = transmitted(outputs);
    assert!(!sent.is_empty());
    assert_eq!(
        &sent[0].as_slice()[..8],
        &[0x03, 0x01, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]
    );
}

/// The full four-phase handshake out of a single greet.
#[test]
fn handshake_establishes_both_sides() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());

    let (_, outputs) = a.greet(harness.now).unwrap();
    let (from_a, from_b) = harness.pump(&mut a, &mut b, outputs);

    assert_eq!(a.state(), PeerState::Established);
    assert_eq!(b.state(), PeerState::Established);

    // The initiator saw its hello complete with an RTT.
    assert!(from_a.iter().any(|output| matches!(
        output,
        Output::HelloResult {
            success: true,
            rtt: Some(_),
            ..
        }
    )));
    // Both sides report establishment.
    for outputs in [&from_a, &from_b] {
        assert!(outputs.iter().any(|output| matches!(
            output,
            Output::Event(EndpointEvent::PeerEstablished { .. })
        )));
    }
}

/// S3: both sides pick the same suite and curve and can talk under it.
#[test]
fn cipher_negotiation_agrees() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);

    let chosen = a.current_algorithms().unwrap();
    assert_eq!(chosen, b.current_algorithms().unwrap());
    // Default preference: strongest suite, first supported curve.
    assert_eq!(chosen.0, CipherSuite::Aes256GcmSha256);
    assert_eq!(chosen.1, EllipticCurve::Secp384r1);

    // And data actually flows under the agreed keys.
    let sent = transmitted(a.send_frame(b"negotiated", 0, harness.now));
    let outputs = harness.deliver(&mut b, sent[0].as_slice());
    assert_eq!(delivered_frames(&outputs), vec![b"negotiated".to_vec()]);
}

/// Sequence numbers on outbound data are strictly increasing.
#[test]
fn data_sequence_numbers_are_monotonic() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);

    let mut last = None;
    for i in 0..50u32 {
        let payload = i.to_be_bytes();
        let sent = transmitted(a.send_frame(&payload, 0, harness.now));
        assert_eq!(sent.len(), 1);
        match wire::parse(sent[0].as_slice()).unwrap() {
            Message::Data(view) => {
                if let Some(previous) = last {
                    assert!(view.sequence_number() > previous);
                }
                last = Some(view.sequence_number());
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
}

/// S2: an exact datagram replay delivers nothing and bumps the counter.
#[test]
fn replayed_datagram_is_rejected() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);

    let sent = transmitted(a.send_frame(b"PING", 0, harness.now));
    let datagram = sent[0].as_slice().to_vec();

    let outputs = harness.deliver(&mut b, &datagram);
    assert_eq!(delivered_frames(&outputs), vec![b"PING".to_vec()]);
    let replays_before = b.counters().replays;

    // The identical bytes again: nothing reaches the tap side.
    let outputs = harness.deliver(&mut b, &datagram);
    assert!(delivered_frames(&outputs).is_empty());
    assert_eq!(b.counters().replays, replays_before + 1);
}

/// Out-of-order data within the window is accepted exactly once.
#[test]
fn replay_window_accepts_late_datagrams_once() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);

    let datagrams: Vec<Vec<u8>> = (0..4u8)
        .map(|i| {
            let sent = transmitted(a.send_frame(&[i], 0, harness.now));
            sent[0].as_slice().to_vec()
        })
        .collect();

    // Deliver 0, 2, 3 then the late 1.
    for index in [0usize, 2, 3] {
        let outputs = harness.deliver(&mut b, &datagrams[index]);
        assert_eq!(delivered_frames(&outputs).len(), 1);
    }
    let outputs = harness.deliver(&mut b, &datagrams[1]);
    assert_eq!(delivered_frames(&outputs), vec![vec![1u8]]);

    // The same late datagram again is a replay.
    let outputs = harness.deliver(&mut b, &datagrams[1]);
    assert!(delivered_frames(&outputs).is_empty());
    assert!(b.counters().replays > 0);
}

/// S5: the sequence threshold forces a rekey and traffic continues under
/// the new session without loss or duplication.
#[test]
fn rekey_under_load() {
    let harness = Harness::new();
    let mut small = config();
    small.rekey_threshold = 16;
    let mut a = harness.session("192.0.2.2:12000", 1, small.clone());
    let mut b = harness.session("192.0.2.1:12000", 2, small);
    harness.establish(&mut a, &mut b);

    let first_session = a.current_session_numbers().unwrap().0;
    let mut received = Vec::new();
    let mut sessions_seen = Vec::new();

    for i in 0..20u8 {
        let outputs = a.send_frame(&[i], 0, harness.now);
        // Separate the data datagram from any handshake traffic the send
        // kicked off, deliver the data, and run the handshake to quiet.
        let mut handshake = Vec::new();
        for output in outputs {
            match output {
                Output::Transmit { datagram, .. } => {
                    let meta = match wire::parse(datagram.as_slice()) {
                        Ok(Message::Data(view)) => {
                            Some((view.session_number(), view.sequence_number()))
                        }
                        _ => None,
                    };
                    match meta {
                        Some(numbers) => {
                            sessions_seen.push(numbers);
                            let outs = harness.deliver(&mut b, datagram.as_slice());
                            received.extend(delivered_frames(&outs));
                        }
                        None => handshake.push(Output::Transmit {
                            datagram,
                            class: fscp_core::MessageClass::Control,
                        }),
                    }
                }
                other => handshake.push(other),
            }
        }
        if !handshake.is_empty() {
            harness.pump(&mut a, &mut b, handshake);
        }
    }

    // All twenty payloads arrived exactly once and in order.
    let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
    assert_eq!(received, expected);

    // Sixteen under the first session, four under the newer one.
    let (old, new): (Vec<_>, Vec<_>) = sessions_seen
        .iter()
        .partition(|(session, _)| *session == first_session);
    assert_eq!(old.len(), 16);
    assert_eq!(new.len(), 4);
    assert_eq!(
        old.iter().map(|(_, seq)| *seq).collect::<Vec<_>>(),
        (0..16).collect::<Vec<u32>>()
    );
    assert_eq!(
        new.iter().map(|(_, seq)| *seq).collect::<Vec<_>>(),
        (0..4).collect::<Vec<u32>>()
    );
    assert!(new[0].0 > first_session);
}

/// Property 6: a stale SESSION does not disturb the established session.
#[test]
fn stale_session_message_ignored() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());

    // Capture b's SESSION while the handshake runs.
    let (_, outputs) = a.greet(harness.now).unwrap();
    let mut captured_session = None;
    let mut to_b: Vec<Vec<u8>> = transmitted(outputs)
        .iter()
        .map(|d| d.as_slice().to_vec())
        .collect();
    let mut to_a: Vec<Vec<u8>> = Vec::new();
    for _ in 0..32 {
        if to_a.is_empty() && to_b.is_empty() {
            break;
        }
        for datagram in std::mem::take(&mut to_b) {
            for sent in transmitted(harness.deliver(&mut b, &datagram)) {
                let bytes = sent.as_slice().to_vec();
                if matches!(wire::parse(&bytes), Ok(Message::Session(_))) {
                    captured_session = Some(bytes.clone());
                }
                to_a.push(bytes);
            }
        }
        for datagram in std::mem::take(&mut to_a) {
            for sent in transmitted(harness.deliver(&mut a, &datagram)) {
                to_b.push(sent.as_slice().to_vec());
            }
        }
    }
    assert!(a.is_established() && b.is_established());
    let captured = captured_session.expect("saw a SESSION");
    let numbers_before = a.current_session_numbers();

    // Replaying the old SESSION at `a` must not disturb anything; at most
    // it elicits a retransmitted answer.
    harness.deliver(&mut a, &captured);
    assert_eq!(a.current_session_numbers(), numbers_before);
    assert_eq!(a.state(), PeerState::Established);

    // Data still flows both ways afterwards.
    let sent = transmitted(a.send_frame(b"still up", 0, harness.now));
    let outputs = harness.deliver(&mut b, sent[0].as_slice());
    assert_eq!(delivered_frames(&outputs), vec![b"still up".to_vec()]);
}

/// Property 7: a new host identifier from the same address is a restart;
/// prior keys are discarded and a fresh handshake succeeds.
#[test]
fn restart_detection_rebuilds_session() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);
    let old_numbers = a.current_session_numbers().unwrap();

    // The peer restarts: same address, fresh host identifier, no memory.
    let mut b2 = harness.session("192.0.2.1:12000", 9, config());
    let (_, outputs) = b2.greet(harness.now).unwrap();
    harness.pump(&mut b2, &mut a, outputs);

    assert!(a.is_established());
    assert!(b2.is_established());
    assert_ne!(a.current_session_numbers().unwrap(), old_numbers);

    // Traffic flows with the restarted peer.
    let sent = transmitted(a.send_frame(b"after restart", 0, harness.now));
    let outputs = harness.deliver(&mut b2, sent[0].as_slice());
    assert_eq!(delivered_frames(&outputs), vec![b"after restart".to_vec()]);
}

/// S6: a wrongly signed SESSION_REQUEST is dropped without any state
/// change or reply; a correctly signed one then progresses normally.
#[test]
fn bad_signature_is_isolated() {
    let harness = Harness::new();
    let mut small = config();
    small.rekey_threshold = 2;
    let mut a = harness.session("192.0.2.2:12000", 1, small.clone());
    let mut b = harness.session("192.0.2.1:12000", 2, small);
    harness.establish(&mut a, &mut b);

    let forged_hid = [7u8; 32];
    let suites = [CipherSuite::Aes256GcmSha256];
    let curves = [EllipticCurve::Secp384r1];
    let next_session = b.current_session_numbers().unwrap().1 + 1;

    let mut buf = vec![0u8; 1024];
    let unsigned = wire::write_session_request_unsigned(
        &mut buf,
        next_session,
        &forged_hid,
        &suites,
        &curves,
    )
    .unwrap();
    let wrong_key = PresharedKey::new(b"not the shared key".to_vec());
    let forged_signature = wrong_key.sign(&buf[4..4 + unsigned]);
    let total = wire::seal_handshake(
        &mut buf,
        HandshakeKind::SessionRequest,
        unsigned,
        &forged_signature,
    )
    .unwrap();

    let state_before = b.state();
    let failures_before = b.counters().auth_failures;
    let outputs = harness.deliver(&mut b, &buf[..total]);
    assert!(outputs.is_empty(), "no reply to a forged message");
    assert_eq!(b.state(), state_before);
    assert_eq!(b.counters().auth_failures, failures_before + 1);

    // A legitimately signed handshake from the real peer still progresses:
    // crossing the sequence threshold rekeys to a fresh session number.
    let numbers_before = b.current_session_numbers().unwrap();
    let mut outputs = a.send_frame(b"tick", 0, harness.now);
    outputs.extend(a.send_frame(b"tock", 0, harness.now));
    harness.pump(&mut a, &mut b, outputs);
    assert!(a.is_established() && b.is_established());
    assert!(b.current_session_numbers().unwrap().1 > numbers_before.1);
}

/// S4 (protocol half): a CONTACT_REQUEST surfaces a lookup at the
/// introducer and the CONTACT answer makes the requester greet the
/// introduced address.
#[test]
fn contact_request_and_introduction() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);

    let hash_c = CertificateHash([0xCC; 32]);
    let c_addr = "198.51.100.7:12000".parse().unwrap();

    // a asks b about c.
    let sent = transmitted(a.send_contact_request(&[hash_c], harness.now));
    assert_eq!(sent.len(), 1);
    let outputs = harness.deliver(&mut b, sent[0].as_slice());
    let lookups: Vec<_> = outputs
        .iter()
        .filter_map(|output| match output {
            Output::ContactLookup(hashes) => Some(hashes.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(lookups, vec![vec![hash_c]]);

    // The endpoint around b resolves the hash and answers.
    let sent = transmitted(b.send_contact_reply(&[(hash_c, c_addr)], harness.now));
    assert_eq!(sent.len(), 1);
    let outputs = harness.deliver(&mut a, sent[0].as_slice());

    assert!(outputs.iter().any(|output| matches!(
        output,
        Output::Event(EndpointEvent::ContactReceived { hash, addr })
            if *hash == hash_c && *addr == c_addr
    )));
    assert!(outputs
        .iter()
        .any(|output| matches!(output, Output::GreetAddress(addr) if *addr == c_addr)));

    // The requester then completes a full handshake with c unaided.
    let mut a_c = harness.session("198.51.100.7:12000", 1, config());
    let mut c = harness.session("192.0.2.2:12000", 3, config());
    harness.establish(&mut a_c, &mut c);
}

/// Unknown introductions are remembered per peer and consumed once.
#[test]
fn pending_contact_interest_is_tracked() {
    let harness = Harness::new();
    let mut b = harness.session("192.0.2.2:12000", 2, config());
    let hash = CertificateHash([0xAB; 32]);

    b.remember_contact_interest([hash]);
    assert!(b.take_contact_interest(&hash));
    assert!(!b.take_contact_interest(&hash));
}

/// Keep-alives flow on an idle established link; prolonged silence kills
/// the session.
#[test]
fn keepalive_then_timeout() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session("192.0.2.1:12000", 2, config());
    harness.establish(&mut a, &mut b);

    // Past the keep-alive period: a probe goes out.
    let at = harness.now + Duration::from_secs(11);
    let sent = transmitted(a.poll_timers(at));
    assert!(!sent.is_empty());
    let parsed = wire::parse(sent[0].as_slice()).unwrap();
    assert!(matches!(
        parsed,
        Message::Data(ref view) if view.kind() == wire::DataKind::KeepAlive
    ));
    // The peer absorbs it silently.
    let outputs = harness.deliver(&mut b, sent[0].as_slice());
    assert!(delivered_frames(&outputs).is_empty());

    // Past the session timeout with nothing received: the session is lost.
    let at = harness.now + Duration::from_secs(61);
    let outputs = a.poll_timers(at);
    assert!(outputs.iter().any(|output| matches!(
        output,
        Output::Event(EndpointEvent::PeerLost {
            reason: LossReason::Timeout,
            ..
        })
    )));
    assert_eq!(a.defunct(), Some(LossReason::Timeout));
}

/// Age alone forces a rekey even on a quiet link.
#[test]
fn rekey_by_session_age() {
    let harness = Harness::new();
    let mut short = config();
    short.max_session_age = Duration::from_secs(5);
    // Keep the keep-alive and timeout machinery out of the way.
    short.keepalive_period = Duration::from_secs(3600);
    short.session_timeout = Duration::from_secs(7200);
    let mut a = harness.session("192.0.2.2:12000", 1, short.clone());
    let mut b = harness.session("192.0.2.1:12000", 2, short);
    harness.establish(&mut a, &mut b);
    let old = a.current_session_numbers().unwrap();

    let at = harness.now + Duration::from_secs(6);
    let outputs = a.poll_timers(at);
    assert_eq!(a.state(), PeerState::Rekeying);
    harness.pump(&mut a, &mut b, outputs);

    assert_eq!(a.state(), PeerState::Established);
    assert!(a.current_session_numbers().unwrap().0 > old.0);
}

/// Frames queued while no session exists are dropped, not buffered.
#[test]
fn no_session_no_data() {
    let harness = Harness::new();
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    assert!(a.send_frame(b"too early", 0, harness.now).is_empty());
}

/// Mixed-key deployments never get a session up.
#[test]
fn mismatched_preshared_keys_never_establish() {
    let harness = Harness::new();
    let other = Arc::new(Identity::from_preshared(PresharedKey::new(
        b"a different key entirely".to_vec(),
    )));
    let mut a = harness.session("192.0.2.2:12000", 1, config());
    let mut b = harness.session_with_identity("192.0.2.1:12000", 2, config(), other);

    let (_, outputs) = a.greet(harness.now).unwrap();
    harness.pump(&mut a, &mut b, outputs);

    assert!(!a.is_established());
    assert!(!b.is_established());
    assert!(a.counters().auth_failures > 0 || b.counters().auth_failures > 0);
}
