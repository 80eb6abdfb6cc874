//! Endpoint forms: IP endpoints and hostname endpoints.

use super::{Hostname, InvalidArgument};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A hostname with a port, canonically `foo.bar.net:12000`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostnameEndpoint {
    /// The hostname
    pub host: Hostname,
    /// The port number
    pub port: u16,
}

impl FromStr for HostnameEndpoint {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidArgument::new("HostnameEndpoint", s);
        let (host, port) = s.rsplit_once(':').ok_or_else(err)?;
        Ok(Self {
            host: host.parse().map_err(|_| err())?,
            port: port.parse().map_err(|_| err())?,
        })
    }
}

impl fmt::Display for HostnameEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Any configured endpoint: an IPv4/IPv6 socket address or a hostname with
/// a port. Hostname resolution happens at the boundary, not in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostEndpoint {
    /// A literal IP endpoint (`9.0.0.1:12000` or `[fe80::a:0]:12000`)
    Ip(SocketAddr),
    /// A hostname endpoint (`foo.bar.net:12000`)
    Hostname(HostnameEndpoint),
}

impl FromStr for HostEndpoint {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }
        s.parse::<HostnameEndpoint>()
            .map(Self::Hostname)
            .map_err(|_| InvalidArgument::new("HostEndpoint", s))
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => addr.fmt(f),
            Self::Hostname(endpoint) => endpoint.fmt(f),
        }
    }
}
