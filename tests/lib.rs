//! Shared harness for driving peer sessions back to back.
//!
//! The protocol scenarios run two (or three) [`PeerSession`] state machines
//! with datagrams carried by hand instead of a socket, which makes loss,
//! replay and reordering exact and deterministic.

use fscp_core::{
    EndpointConfig, MemoryPool, Output, PeerSession, PoolConfig, SharedBuffer,
};
use fscp_crypto::{Identity, PresharedKey, ValidationPolicy};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on ping-pong rounds before a pump is declared stuck
const MAX_PUMP_ROUNDS: usize = 64;

/// A deterministic two-party wire
pub struct Harness {
    pool: MemoryPool,
    /// The clock handed to every session call
    pub now: Instant,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Create a harness with its own buffer pool
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: MemoryPool::new(PoolConfig::default()),
            now: Instant::now(),
        }
    }

    /// A session talking to `addr`, authenticated by the shared test key
    pub fn session(&self, addr: &str, hid_byte: u8, config: EndpointConfig) -> PeerSession {
        let identity = Arc::new(Identity::from_preshared(PresharedKey::new(
            b"integration test key".to_vec(),
        )));
        self.session_with_identity(addr, hid_byte, config, identity)
    }

    /// A session with an explicit identity (e.g. a mismatched key)
    pub fn session_with_identity(
        &self,
        addr: &str,
        hid_byte: u8,
        config: EndpointConfig,
        identity: Arc<Identity>,
    ) -> PeerSession {
        let addr: SocketAddr = addr.parse().expect("valid test address");
        PeerSession::new(
            addr,
            Arc::new(config),
            identity,
            Arc::new(ValidationPolicy::None),
            self.pool.clone(),
            [hid_byte; 32],
            self.now,
        )
    }

    /// Hand raw datagram bytes to a session
    pub fn deliver(&self, target: &mut PeerSession, datagram: &[u8]) -> Vec<Output> {
        let mut buffer = self.pool.allocate().expect("pool not exhausted");
        buffer.copy_from(datagram);
        target.handle_datagram(buffer, self.now)
    }

    /// Carry datagrams between two sessions until the wire goes quiet.
    ///
    /// `seed` are outputs already produced by `a`. Returns every
    /// non-transmit output each side produced, in order.
    pub fn pump(
        &self,
        a: &mut PeerSession,
        b: &mut PeerSession,
        seed: Vec<Output>,
    ) -> (Vec<Output>, Vec<Output>) {
        let mut to_b: Vec<SharedBuffer> = Vec::new();
        let mut to_a: Vec<SharedBuffer> = Vec::new();
        let mut from_a = Vec::new();
        let mut from_b = Vec::new();

        sort_outputs(seed, &mut to_b, &mut from_a);

        for _ in 0..MAX_PUMP_ROUNDS {
            if to_a.is_empty() && to_b.is_empty() {
                return (from_a, from_b);
            }
            for datagram in std::mem::take(&mut to_b) {
                let outputs = self.deliver(b, datagram.as_slice());
                sort_outputs(outputs, &mut to_a, &mut from_b);
            }
            for datagram in std::mem::take(&mut to_a) {
                let outputs = self.deliver(a, datagram.as_slice());
                sort_outputs(outputs, &mut to_b, &mut from_a);
            }
        }
        panic!("wire never went quiet");
    }

    /// Bring two sessions to the established state via a hello from `a`
    pub fn establish(&self, a: &mut PeerSession, b: &mut PeerSession) {
        let (_, outputs) = a.greet(self.now).expect("greet");
        self.pump(a, b, outputs);
        assert!(a.is_established(), "initiator not established");
        assert!(b.is_established(), "responder not established");
    }
}

fn sort_outputs(
    outputs: Vec<Output>,
    wire: &mut Vec<SharedBuffer>,
    rest: &mut Vec<Output>,
) {
    for output in outputs {
        match output {
            Output::Transmit { datagram, .. } => wire.push(datagram),
            other => rest.push(other),
        }
    }
}

/// Collect the delivered plaintext frames out of a list of outputs
pub fn delivered_frames(outputs: &[Output]) -> Vec<Vec<u8>> {
    outputs
        .iter()
        .filter_map(|output| match output {
            Output::Deliver { datagram, .. } => Some(
                datagram.as_slice()[fscp_core::wire::DATA_PAYLOAD_OFFSET..].to_vec(),
            ),
            _ => None,
        })
        .collect()
}

/// Collect the transmitted datagrams out of a list of outputs
pub fn transmitted(outputs: Vec<Output>) -> Vec<SharedBuffer> {
    outputs
        .into_iter()
        .filter_map(|output| match output {
            Output::Transmit { datagram, .. } => Some(datagram),
            _ => None,
        })
        .collect()
}
