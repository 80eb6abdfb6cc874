//! # FSCP Core
//!
//! Core engine for the FreeLAN Secure Channel Protocol: the per-peer state
//! machine that negotiates keys, encrypts data, paces and retries control
//! messages, rekeys, and moves payloads between a TAP device and an
//! arbitrary number of peers over one shared UDP socket.
//!
//! This crate provides:
//! - **Message codec**: zero-copy parsing and emission of FSCP datagrams
//! - **Memory pool**: bounded-allocation buffers for the datagram path
//! - **Peer sessions**: handshake, AEAD data plane, replay protection,
//!   rekeying, keep-alives and the contact sub-protocol
//! - **Router**: switch / hub / router frame dispatch
//! - **Endpoint**: the socket, tap and timer loops that tie it together
//! - **Value types**: the string-round-tripping boundary types
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Endpoint                             │
//! │  UDP socket · tap device · timer wheel · event channel       │
//! ├──────────────────────────────────────────────────────────────┤
//! │   PeerSession (one per remote peer, strand-serialized)       │
//! │   handshake · session keys · replay window · pacing          │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Router          │  MessageCodec       │  MemoryPool        │
//! │   frame dispatch  │  wire format        │  datagram buffers  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use fscp_core::{Endpoint, EndpointConfig, MemoryTap};
//! use fscp_crypto::{Identity, PresharedKey, ValidationPolicy};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tap, _port) = MemoryTap::new(1500, None);
//!     let identity = Identity::from_preshared(PresharedKey::new(b"secret".to_vec()));
//!     let (endpoint, mut events) = Endpoint::bind(
//!         "0.0.0.0:12000".parse()?,
//!         EndpointConfig::default(),
//!         identity,
//!         Arc::new(ValidationPolicy::None),
//!         tap,
//!     )?;
//!     endpoint.start().await;
//!
//!     let rtt = endpoint.greet("192.0.2.2:12000".parse()?).await?;
//!     println!("peer answered in {rtt:?}");
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     endpoint.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod peer;
pub mod pool;
pub mod router;
pub mod tap;
pub mod types;
pub mod wire;

pub use config::{EndpointConfig, RetransmitConfig, RoutingConfig};
pub use endpoint::Endpoint;
pub use error::{Error, SessionError, WireError};
pub use events::{EndpointEvent, LossReason};
pub use peer::{MessageClass, Output, PeerCounters, PeerSession, PeerState, ReplayWindow};
pub use pool::{MemoryPool, PoolConfig, PooledBuffer, SharedBuffer};
pub use router::{Dispatch, Router, RoutingMethod, TapLayer};
pub use tap::{MemoryTap, MemoryTapPort, TapAdapter, TapError};
pub use types::{
    EthernetAddress, HostEndpoint, Hostname, HostnameEndpoint, InvalidArgument, Ipv4Route,
    Ipv6Route,
};
pub use wire::PROTOCOL_VERSION;
