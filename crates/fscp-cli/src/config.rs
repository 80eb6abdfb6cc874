//! Configuration file for the diagnostic node.

use anyhow::{bail, Context};
use fscp_core::{EndpointConfig, RoutingMethod};
use fscp_crypto::{Certificate, Identity, PresharedKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity material
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Identity material: either a certificate/key pair or a pre-shared key
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// DER-encoded X.509 signature certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<PathBuf>,
    /// PKCS#8 RSA private key (PEM or DER)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,
    /// Pre-shared key; replaces signatures with HMAC
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_shared_key: Option<String>,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Peers to greet at startup
    #[serde(default)]
    pub contacts: Vec<SocketAddr>,
    /// Answer hellos from addresses we never greeted
    #[serde(default = "default_true")]
    pub accept_unknown_peers: bool,
    /// Frame dispatch: "switch", "hub" or "router"
    #[serde(default = "default_method")]
    pub routing_method: String,
    /// Forward peer-sourced frames to other peers
    #[serde(default)]
    pub relay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            contacts: Vec::new(),
            accept_unknown_peers: true,
            routing_method: default_method(),
            relay: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:12000".parse().expect("valid literal")
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "hub".to_string()
}

impl Config {
    /// Load from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Build the engine identity from the configured material
    pub fn identity(&self) -> anyhow::Result<Identity> {
        if let Some(psk) = &self.identity.pre_shared_key {
            if self.identity.certificate_file.is_some() {
                bail!("configure either a pre-shared key or a certificate, not both");
            }
            return Ok(Identity::from_preshared(PresharedKey::new(
                psk.as_bytes().to_vec(),
            )));
        }
        let (Some(cert_path), Some(key_path)) = (
            &self.identity.certificate_file,
            &self.identity.private_key_file,
        ) else {
            bail!("no identity configured: set pre_shared_key or certificate_file + private_key_file");
        };

        let der = fs::read(cert_path)
            .with_context(|| format!("reading {}", cert_path.display()))?;
        let certificate = Certificate::from_der(&der)
            .with_context(|| format!("parsing {}", cert_path.display()))?;

        let key_bytes = fs::read(key_path)
            .with_context(|| format!("reading {}", key_path.display()))?;
        let private_key = match std::str::from_utf8(&key_bytes) {
            Ok(pem) if pem.contains("-----BEGIN") => RsaPrivateKey::from_pkcs8_pem(pem)
                .with_context(|| format!("parsing {}", key_path.display()))?,
            _ => RsaPrivateKey::from_pkcs8_der(&key_bytes)
                .with_context(|| format!("parsing {}", key_path.display()))?,
        };

        Ok(Identity::from_rsa(certificate, private_key))
    }

    /// Build the endpoint configuration
    pub fn endpoint_config(&self) -> anyhow::Result<EndpointConfig> {
        let method = match self.network.routing_method.as_str() {
            "switch" => RoutingMethod::Switch,
            "hub" => RoutingMethod::Hub,
            "router" => RoutingMethod::Router,
            other => bail!("unknown routing method {other:?}"),
        };
        let mut config = EndpointConfig {
            accept_unknown_peers: self.network.accept_unknown_peers,
            ..EndpointConfig::default()
        };
        config.routing.method = method;
        config.routing.relay = self.network.relay;
        Ok(config)
    }
}
