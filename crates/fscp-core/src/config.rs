//! Endpoint configuration.

use crate::pool::PoolConfig;
use crate::router::{RoutingMethod, TapLayer};
use crate::types::{Ipv4Route, Ipv6Route};
use fscp_crypto::{CipherSuite, EllipticCurve};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retransmission pacing for control messages.
///
/// HELLO, PRESENTATION, SESSION_REQUEST and SESSION are retried with
/// exponential backoff until progress is observed or the attempts run out,
/// at which point the peer is declared unreachable. Data-plane messages are
/// never retransmitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetransmitConfig {
    /// Delay before the first retransmission
    pub initial_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: u32,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Attempts before declaring the peer unreachable
    pub max_attempts: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetransmitConfig {
    /// Delay to wait after the given number of attempts already sent
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Frame dispatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Switch, hub or router behaviour
    pub method: RoutingMethod,
    /// Forward peer-sourced frames to other peers
    pub relay: bool,
    /// Whether the tap device carries Ethernet frames or raw IP packets
    pub layer: TapLayer,
    /// Static IPv4 routes (router mode)
    pub ipv4_routes: Vec<Ipv4Route>,
    /// Static IPv6 routes (router mode)
    pub ipv6_routes: Vec<Ipv6Route>,
}

/// Everything a running endpoint needs besides its identity and devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Advertised cipher suites, in preference order
    pub cipher_suites: Vec<CipherSuite>,
    /// Advertised elliptic curves, in preference order
    pub elliptic_curves: Vec<EllipticCurve>,
    /// Answer HELLO and PRESENTATION from addresses we never greeted
    pub accept_unknown_peers: bool,
    /// How long a `greet` waits for its HELLO_RESPONSE
    pub hello_timeout: Duration,
    /// Control message retransmission pacing
    pub retransmit: RetransmitConfig,
    /// Idle time before a KEEP_ALIVE is sent
    pub keepalive_period: Duration,
    /// Silence before an established session is declared lost
    pub session_timeout: Duration,
    /// Outbound sequence number that forces a rekey
    pub rekey_threshold: u32,
    /// Session age that forces a rekey
    pub max_session_age: Duration,
    /// How long a served contact endpoint stays credible
    pub contact_validity: Duration,
    /// Frame dispatch behaviour
    pub routing: RoutingConfig,
    /// Datagram buffer pool sizing
    #[serde(skip)]
    pub pool: PoolConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            cipher_suites: CipherSuite::ALL.to_vec(),
            elliptic_curves: EllipticCurve::SUPPORTED.to_vec(),
            accept_unknown_peers: true,
            hello_timeout: Duration::from_secs(3),
            retransmit: RetransmitConfig::default(),
            keepalive_period: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            rekey_threshold: 1 << 28,
            max_session_age: Duration::from_secs(600),
            contact_validity: Duration::from_secs(180),
            routing: RoutingConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}
