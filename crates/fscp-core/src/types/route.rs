//! IP routes with optional gateways.
//!
//! Canonical forms are `9.0.0.0/24` / `9.0.0.0/24@9.0.0.254` and
//! `fe80::a:0/64` / `fe80::a:0/64@fe80::1`.

use super::InvalidArgument;
use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv4 network with an optional gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Route {
    /// The destination network
    pub network: Ipv4Net,
    /// Next hop, if any
    pub gateway: Option<Ipv4Addr>,
}

impl FromStr for Ipv4Route {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidArgument::new("IPv4Route", s);
        let (network, gateway) = match s.split_once('@') {
            Some((network, gateway)) => (network, Some(gateway)),
            None => (s, None),
        };
        Ok(Self {
            network: network.parse().map_err(|_| err())?,
            gateway: gateway.map(|g| g.parse().map_err(|_| err())).transpose()?,
        })
    }
}

impl fmt::Display for Ipv4Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gateway) => write!(f, "{}@{}", self.network, gateway),
            None => self.network.fmt(f),
        }
    }
}

/// An IPv6 network with an optional gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Route {
    /// The destination network
    pub network: Ipv6Net,
    /// Next hop, if any
    pub gateway: Option<Ipv6Addr>,
}

impl FromStr for Ipv6Route {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidArgument::new("IPv6Route", s);
        let (network, gateway) = match s.split_once('@') {
            Some((network, gateway)) => (network, Some(gateway)),
            None => (s, None),
        };
        Ok(Self {
            network: network.parse().map_err(|_| err())?,
            gateway: gateway.map(|g| g.parse().map_err(|_| err())).transpose()?,
        })
    }
}

impl fmt::Display for Ipv6Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gateway) => write!(f, "{}@{}", self.network, gateway),
            None => self.network.fmt(f),
        }
    }
}

macro_rules! string_serde {
    ($type:ty) => {
        impl serde::Serialize for $type {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $type {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Ipv4Route);
string_serde!(Ipv6Route);
