//! FSCP diagnostic node.
//!
//! A small chat-style tool for exercising the engine against live peers:
//! it binds an endpoint on an in-memory tap, greets the configured
//! contacts, prints endpoint events, and tunnels stdin lines to every
//! established peer. Real deployments attach a platform TAP driver instead
//! of the in-memory one.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use fscp_core::{Endpoint, EndpointEvent, MemoryTap};
use fscp_crypto::{Certificate, CertificateHash, ValidationPolicy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// FSCP - FreeLAN Secure Channel Protocol diagnostic node
#[derive(Parser)]
#[command(name = "fscp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "fscp.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node: greet contacts, print events, tunnel stdin lines
    Run {
        /// Override the configured listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Probe a single peer and report the round-trip time
    Greet {
        /// The peer's UDP address
        address: SocketAddr,
    },

    /// Print the SHA-256 hash of a DER certificate (the CONTACT identifier)
    HashCert {
        /// Path to the DER-encoded certificate
        file: PathBuf,
    },

    /// Ask an established peer for introductions by certificate hash
    Contact {
        /// The introducing peer's UDP address
        peer: SocketAddr,
        /// Hex-encoded certificate hashes to ask about
        #[arg(required = true)]
        hashes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if cli.verbose { "debug" } else { "info" }.into()
            }),
        )
        .init();

    match cli.command {
        Commands::HashCert { file } => {
            let der = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let certificate = Certificate::from_der(&der)?;
            println!("{}", certificate.hash());
            return Ok(());
        }
        Commands::Run { bind } => run(&cli.config, bind).await,
        Commands::Greet { address } => greet(&cli.config, address).await,
        Commands::Contact { peer, hashes } => contact(&cli.config, peer, &hashes).await,
    }
}

async fn bind_endpoint(
    config_path: &PathBuf,
    bind: Option<SocketAddr>,
) -> anyhow::Result<(
    Endpoint,
    tokio::sync::mpsc::Receiver<EndpointEvent>,
    fscp_core::MemoryTapPort,
    Config,
)> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default()
    };
    let identity = config.identity()?;
    let endpoint_config = config.endpoint_config()?;
    let listen = bind.unwrap_or(config.network.listen_addr);

    let (tap, port) = MemoryTap::new(1500, None);
    let (endpoint, events) = Endpoint::bind(
        listen,
        endpoint_config,
        identity,
        Arc::new(ValidationPolicy::None),
        tap,
    )?;
    endpoint.start().await;
    tracing::info!(local = %endpoint.local_addr()?, "listening");
    Ok((endpoint, events, port, config))
}

async fn run(config_path: &PathBuf, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let (endpoint, mut events, mut port, config) = bind_endpoint(config_path, bind).await?;

    for contact in &config.network.contacts {
        let endpoint = endpoint.clone();
        let contact = *contact;
        tokio::spawn(async move {
            match endpoint.greet(contact).await {
                Ok(rtt) => tracing::info!(peer = %contact, ?rtt, "contact answered"),
                Err(error) => tracing::warn!(peer = %contact, %error, "contact unreachable"),
            }
        });
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            frame = port.collect.recv() => {
                match frame {
                    Some(frame) => println!("<< {}", String::from_utf8_lossy(&frame)),
                    None => break,
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) if !line.is_empty() => {
                        // Injected tap-side, so it flows through the router
                        // to every established peer.
                        if port.inject.send(line.into_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    endpoint.close().await;
    Ok(())
}

async fn greet(config_path: &PathBuf, address: SocketAddr) -> anyhow::Result<()> {
    let (endpoint, _events, _port, _config) = bind_endpoint(config_path, None).await?;
    match endpoint.greet(address).await {
        Ok(rtt) => println!("{address} answered in {rtt:?}"),
        Err(error) => println!("{address} did not answer: {error}"),
    }
    endpoint.close().await;
    Ok(())
}

async fn contact(
    config_path: &PathBuf,
    peer: SocketAddr,
    hashes: &[String],
) -> anyhow::Result<()> {
    let parsed: Vec<CertificateHash> = hashes
        .iter()
        .map(|hash| {
            let bytes = hex::decode(hash).context("hash is not hex")?;
            CertificateHash::from_slice(&bytes).context("hash must be 32 bytes")
        })
        .collect::<anyhow::Result<_>>()?;

    let (endpoint, mut events, _port, _config) = bind_endpoint(config_path, None).await?;

    endpoint
        .greet(peer)
        .await
        .map_err(|error| anyhow::anyhow!("introducer unreachable: {error}"))?;
    endpoint.send_contact_request(peer, &parsed).await?;

    // Introductions come back asynchronously; report what arrives.
    let deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(EndpointEvent::ContactReceived { hash, addr }) => {
                        println!("{hash} is at {addr}");
                    }
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            _ = &mut deadline => break,
        }
    }

    endpoint.close().await;
    Ok(())
}

fn print_event(event: &EndpointEvent) {
    match event {
        EndpointEvent::PeerEstablished {
            addr,
            certificate_hash,
        } => match certificate_hash {
            Some(hash) => println!("** session established with {addr} ({hash})"),
            None => println!("** session established with {addr}"),
        },
        EndpointEvent::PeerLost { addr, reason } => {
            println!("** lost {addr}: {reason}");
        }
        EndpointEvent::HelloCompleted { addr, rtt, success } => {
            if *success {
                println!("** {addr} answered in {rtt:?}");
            } else {
                println!("** {addr} is not answering");
            }
        }
        EndpointEvent::ContactReceived { hash, addr } => {
            println!("** introduction: {hash} is at {addr}");
        }
        EndpointEvent::FatalError { message } => {
            eprintln!("!! fatal: {message}");
        }
    }
}
