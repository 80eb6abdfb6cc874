//! Boundary value types.
//!
//! Everything the engine accepts from configuration or hands across
//! component seams round-trips exactly through its canonical string form;
//! invalid input produces a typed error, never a panic.

mod ethernet;
mod host;
mod hostname;
mod route;

pub use ethernet::EthernetAddress;
pub use host::{HostEndpoint, HostnameEndpoint};
pub use hostname::Hostname;
pub use route::{Ipv4Route, Ipv6Route};

use thiserror::Error;

/// Parse failure for any boundary value type
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {kind}: {input:?}")]
pub struct InvalidArgument {
    /// The type that rejected the input
    pub kind: &'static str,
    /// The offending input
    pub input: String,
}

impl InvalidArgument {
    pub(crate) fn new(kind: &'static str, input: &str) -> Self {
        Self {
            kind,
            input: input.to_string(),
        }
    }
}
