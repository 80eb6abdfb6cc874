//! Frame dispatch between the tap device and the peer set.
//!
//! The router is the only component that looks at Ethernet or IP headers,
//! and it looks no deeper than switching and routing require:
//!
//! - **Switch**: learning bridge. Source addresses of peer frames populate
//!   a TTL'd table; unicast tap frames with a known destination go to that
//!   peer alone, everything else floods.
//! - **Hub**: every frame goes to every peer.
//! - **Router**: longest-prefix match over the networks peers advertise;
//!   packets with no matching route are dropped.
//!
//! With relay disabled (the default), frames received from a peer go only
//! to the tap; with relay enabled they are additionally forwarded to other
//! peers under the same rules.

use crate::types::EthernetAddress;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Frame dispatch behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutingMethod {
    /// Learning bridge
    #[default]
    Switch,
    /// Flood everything
    Hub,
    /// Longest-prefix-match IP routing
    Router,
}

/// What kind of frames the tap device carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TapLayer {
    /// Ethernet frames (TAP)
    #[default]
    Ethernet,
    /// Raw IP packets (TUN)
    Ip,
}

/// Where a frame should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Drop the frame
    None,
    /// Send to a single peer
    Unicast(SocketAddr),
    /// Send to every established peer (minus the source, for relayed frames)
    Flood,
}

/// Outcome for a frame received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDispatch {
    /// Deliver the frame to the tap device
    pub to_tap: bool,
    /// Forward to other peers (always [`Dispatch::None`] unless relaying)
    pub relay: Dispatch,
}

const ETHERNET_HEADER_SIZE: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

/// How long a learned switch entry stays valid
const SWITCH_ENTRY_TTL: Duration = Duration::from_secs(120);

struct SwitchEntry {
    peer: SocketAddr,
    learned_at: Instant,
}

/// The frame dispatcher
pub struct Router {
    method: RoutingMethod,
    layer: TapLayer,
    relay: bool,
    switch_table: HashMap<EthernetAddress, SwitchEntry>,
    ipv4_routes: Vec<(Ipv4Net, SocketAddr)>,
    ipv6_routes: Vec<(Ipv6Net, SocketAddr)>,
}

impl Router {
    /// Create a router
    #[must_use]
    pub fn new(method: RoutingMethod, layer: TapLayer, relay: bool) -> Self {
        Self {
            method,
            layer,
            relay,
            switch_table: HashMap::new(),
            ipv4_routes: Vec::new(),
            ipv6_routes: Vec::new(),
        }
    }

    /// Replace the networks a peer advertises (router mode)
    pub fn set_peer_networks(
        &mut self,
        peer: SocketAddr,
        ipv4: Vec<Ipv4Net>,
        ipv6: Vec<Ipv6Net>,
    ) {
        self.ipv4_routes.retain(|(_, p)| *p != peer);
        self.ipv6_routes.retain(|(_, p)| *p != peer);
        self.ipv4_routes
            .extend(ipv4.into_iter().map(|net| (net, peer)));
        self.ipv6_routes
            .extend(ipv6.into_iter().map(|net| (net, peer)));
    }

    /// Forget everything learned about a peer
    pub fn peer_removed(&mut self, peer: SocketAddr) {
        self.switch_table.retain(|_, entry| entry.peer != peer);
        self.ipv4_routes.retain(|(_, p)| *p != peer);
        self.ipv6_routes.retain(|(_, p)| *p != peer);
    }

    /// Drop switch entries past their TTL
    pub fn purge_expired(&mut self, now: Instant) {
        self.switch_table
            .retain(|_, entry| now.duration_since(entry.learned_at) < SWITCH_ENTRY_TTL);
    }

    /// Decide where a tap-side frame goes
    pub fn classify_outbound(&mut self, frame: &[u8], now: Instant) -> Dispatch {
        match self.method {
            RoutingMethod::Hub => Dispatch::Flood,
            RoutingMethod::Switch => self.switch_outbound(frame, now),
            RoutingMethod::Router => self.route_lookup(frame),
        }
    }

    /// Decide what to do with a frame received from `from`
    pub fn classify_inbound(
        &mut self,
        frame: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> InboundDispatch {
        if self.method == RoutingMethod::Switch && self.layer == TapLayer::Ethernet {
            if let Some(src) = ethernet_source(frame) {
                if src.is_unicast() {
                    self.switch_table.insert(
                        src,
                        SwitchEntry {
                            peer: from,
                            learned_at: now,
                        },
                    );
                }
            }
        }

        let relay = if self.relay {
            match self.method {
                RoutingMethod::Hub => Dispatch::Flood,
                RoutingMethod::Switch => match self.switch_outbound(frame, now) {
                    // Never hairpin a relayed frame back to its source.
                    Dispatch::Unicast(peer) if peer == from => Dispatch::None,
                    other => other,
                },
                RoutingMethod::Router => match self.route_lookup(frame) {
                    Dispatch::Unicast(peer) if peer == from => Dispatch::None,
                    other => other,
                },
            }
        } else {
            Dispatch::None
        };

        InboundDispatch {
            to_tap: true,
            relay,
        }
    }

    fn switch_outbound(&mut self, frame: &[u8], now: Instant) -> Dispatch {
        if self.layer != TapLayer::Ethernet {
            // No addresses to learn from; degrade to hub behaviour.
            return Dispatch::Flood;
        }
        let Some(dst) = ethernet_destination(frame) else {
            return Dispatch::None;
        };
        if !dst.is_unicast() {
            return Dispatch::Flood;
        }
        match self.switch_table.get(&dst) {
            Some(entry) if now.duration_since(entry.learned_at) < SWITCH_ENTRY_TTL => {
                Dispatch::Unicast(entry.peer)
            }
            _ => Dispatch::Flood,
        }
    }

    fn route_lookup(&self, frame: &[u8]) -> Dispatch {
        match destination_ip(frame, self.layer) {
            Some(IpAddr::V4(dst)) => self
                .ipv4_routes
                .iter()
                .filter(|(net, _)| net.contains(&dst))
                .max_by_key(|(net, _)| net.prefix_len())
                .map_or(Dispatch::None, |(_, peer)| Dispatch::Unicast(*peer)),
            Some(IpAddr::V6(dst)) => self
                .ipv6_routes
                .iter()
                .filter(|(net, _)| net.contains(&dst))
                .max_by_key(|(net, _)| net.prefix_len())
                .map_or(Dispatch::None, |(_, peer)| Dispatch::Unicast(*peer)),
            None => Dispatch::None,
        }
    }
}

fn ethernet_destination(frame: &[u8]) -> Option<EthernetAddress> {
    let octets: [u8; 6] = frame.get(0..6)?.try_into().ok()?;
    Some(EthernetAddress(octets))
}

fn ethernet_source(frame: &[u8]) -> Option<EthernetAddress> {
    let octets: [u8; 6] = frame.get(6..12)?.try_into().ok()?;
    Some(EthernetAddress(octets))
}

fn destination_ip(frame: &[u8], layer: TapLayer) -> Option<IpAddr> {
    let packet = match layer {
        TapLayer::Ip => frame,
        TapLayer::Ethernet => {
            let ethertype =
                u16::from_be_bytes(frame.get(12..14)?.try_into().ok()?);
            if ethertype != ETHERTYPE_IPV4 && ethertype != ETHERTYPE_IPV6 {
                return None;
            }
            frame.get(ETHERNET_HEADER_SIZE..)?
        }
    };

    match packet.first()? >> 4 {
        4 => {
            let octets: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
            Some(Ipv4Addr::from(octets).into())
        }
        6 => {
            let octets: [u8; 16] = packet.get(24..40)?.try_into().ok()?;
            Some(Ipv6Addr::from(octets).into())
        }
        _ => None,
    }
}
