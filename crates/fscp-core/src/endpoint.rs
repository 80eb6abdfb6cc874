//! The engine: one UDP socket, one tap device, many peer sessions.
//!
//! The endpoint owns every shared resource and is the only component that
//! performs I/O. Inbound datagrams are demultiplexed by source address to
//! their [`PeerSession`]; each session is guarded by its own mutex, so
//! datagrams from one peer are handled strictly in arrival order while
//! different peers proceed concurrently. Sessions never call back into the
//! endpoint: they return [`Output`] commands which the endpoint executes
//! after releasing the session lock.
//!
//! ```text
//! UDP recv ──▶ demux by source ──▶ PeerSession ──▶ outputs ──▶ send / tap
//! tap read ──▶ Router ──▶ selected PeerSessions ──▶ encrypt ──▶ UDP send
//! timer tick ──▶ every PeerSession ──▶ retransmits / keep-alives / rekeys
//! ```

use crate::config::EndpointConfig;
use crate::error::{Error, SessionError};
use crate::events::{EndpointEvent, LossReason};
use crate::peer::{MessageClass, Output, PeerSession};
use crate::pool::MemoryPool;
use crate::router::{Dispatch, Router};
use crate::tap::TapAdapter;
use crate::wire::DATA_PAYLOAD_OFFSET;
use dashmap::DashMap;
use fscp_crypto::{random, CertificateHash, CertificateValidator, Identity};
use fscp_transport::{TransportError, UdpTransport};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Poll granularity for the receive loops and the timer wheel
const TICK: Duration = Duration::from_millis(250);
const RECV_POLL: Duration = Duration::from_millis(100);

/// The FSCP endpoint
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<EndpointConfig>,
    identity: Arc<Identity>,
    validator: Arc<dyn CertificateValidator>,
    host_identifier: [u8; 32],
    transport: UdpTransport,
    tap: Arc<dyn TapAdapter>,
    pool: MemoryPool,
    peers: DashMap<SocketAddr, Arc<Mutex<PeerSession>>>,
    by_hash: DashMap<CertificateHash, SocketAddr>,
    router: std::sync::Mutex<Router>,
    events_tx: mpsc::Sender<EndpointEvent>,
    pending_greets: DashMap<(SocketAddr, u32), oneshot::Sender<Result<Duration, SessionError>>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Endpoint {
    /// Bind an endpoint and return it with its event stream.
    ///
    /// The endpoint is idle until [`Endpoint::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the host
    /// identifier cannot be generated.
    pub fn bind(
        bind_addr: SocketAddr,
        config: EndpointConfig,
        identity: Identity,
        validator: Arc<dyn CertificateValidator>,
        tap: Arc<dyn TapAdapter>,
    ) -> Result<(Self, mpsc::Receiver<EndpointEvent>), Error> {
        let transport = UdpTransport::bind(bind_addr)?;
        let host_identifier = random::random_32()?;
        let pool = MemoryPool::new(config.pool);
        let router = Router::new(
            config.routing.method,
            config.routing.layer,
            config.routing.relay,
        );
        let (events_tx, events_rx) = mpsc::channel(256);

        let endpoint = Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                identity: Arc::new(identity),
                validator,
                host_identifier,
                transport,
                tap,
                pool,
                peers: DashMap::new(),
                by_hash: DashMap::new(),
                router: std::sync::Mutex::new(router),
                events_tx,
                pending_greets: DashMap::new(),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        Ok((endpoint, events_rx))
    }

    /// Start the receive, tap and timer loops.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.tap.set_connected_state(true);
        let mut tasks = self.inner.tasks.lock().await;
        let recv = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move { recv.recv_loop().await }));
        let tap = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move { tap.tap_loop().await }));
        let timers = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move { timers.timer_loop().await }));
        tracing::info!(
            local = ?self.inner.transport.local_addr().ok(),
            "endpoint started"
        );
    }

    /// The bound UDP address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Probe a peer with a HELLO exchange; resolves with the round-trip
    /// time once the echo arrives.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TimedOut`] when no response arrives within
    /// the configured hello timeout, [`SessionError::Closed`] if the
    /// endpoint is shut down first.
    pub async fn greet(&self, addr: SocketAddr) -> Result<Duration, SessionError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let now = Instant::now();
        let session = self.inner.session_for(addr, now);
        let (unique_number, outputs) = {
            let mut session = session.lock().await;
            session.greet(now)?
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending_greets.insert((addr, unique_number), tx);
        self.inner.execute_outputs(addr, outputs, now).await;

        let result = tokio::time::timeout(self.inner.config.hello_timeout, rx).await;
        self.inner.pending_greets.remove(&(addr, unique_number));
        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::TimedOut),
        }
    }

    /// Feed an out-of-band address hint for a peer known by certificate
    /// hash and greet it.
    ///
    /// # Errors
    ///
    /// Propagates the greet outcome; see [`Endpoint::greet`].
    pub async fn introduce(
        &self,
        hash: CertificateHash,
        addr: SocketAddr,
    ) -> Result<Duration, SessionError> {
        self.inner.by_hash.insert(hash, addr);
        self.greet(addr).await
    }

    /// Ask an established peer to introduce the owners of `hashes`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PeerLost`] if no session exists for `peer`.
    pub async fn send_contact_request(
        &self,
        peer: SocketAddr,
        hashes: &[CertificateHash],
    ) -> Result<(), SessionError> {
        let Some(session) = self.inner.peers.get(&peer).map(|s| Arc::clone(&s)) else {
            return Err(SessionError::PeerLost("no such peer".to_string()));
        };
        let now = Instant::now();
        let outputs = {
            let mut session = session.lock().await;
            session.send_contact_request(hashes, now)
        };
        self.inner.execute_outputs(peer, outputs, now).await;
        Ok(())
    }

    /// Advertise the IP networks reachable through a peer (router mode)
    pub fn set_peer_networks(&self, peer: SocketAddr, ipv4: Vec<Ipv4Net>, ipv6: Vec<Ipv6Net>) {
        if let Ok(mut router) = self.inner.router.lock() {
            router.set_peer_networks(peer, ipv4, ipv6);
        }
    }

    /// Number of live peer sessions
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Shut the endpoint down.
    ///
    /// Cancels every pending `greet` with [`SessionError::Closed`], reports
    /// `PeerLost` for every session and stops all loops before returning.
    pub async fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.transport.close();
        self.inner.tap.set_connected_state(false);
        self.inner.tap.close();

        let pending: Vec<_> = self
            .inner
            .pending_greets
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for key in pending {
            if let Some((_, tx)) = self.inner.pending_greets.remove(&key) {
                let _ = tx.send(Err(SessionError::Closed));
            }
        }

        let peers: Vec<_> = self
            .inner
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in peers {
            let outputs = session.lock().await.close();
            for output in outputs {
                if let Output::Event(event) = output {
                    let _ = self.inner.events_tx.send(event).await;
                }
            }
        }
        self.inner.peers.clear();
        self.inner.by_hash.clear();

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("endpoint closed");
    }
}

impl Inner {
    fn session_for(self: &Arc<Self>, addr: SocketAddr, now: Instant) -> Arc<Mutex<PeerSession>> {
        Arc::clone(
            &self
                .peers
                .entry(addr)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(PeerSession::new(
                        addr,
                        Arc::clone(&self.config),
                        Arc::clone(&self.identity),
                        Arc::clone(&self.validator),
                        self.pool.clone(),
                        self.host_identifier,
                        now,
                    )))
                })
                .value(),
        )
    }

    async fn recv_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let mut buffer = match self.pool.allocate() {
                Ok(buffer) => buffer,
                Err(error) => {
                    tracing::warn!(%error, "receive stalled: no buffer");
                    tokio::time::sleep(RECV_POLL).await;
                    continue;
                }
            };
            let received = tokio::time::timeout(
                RECV_POLL,
                self.transport.recv_from(buffer.block_mut()),
            )
            .await;
            let (size, from) = match received {
                Ok(Ok(result)) => result,
                Ok(Err(TransportError::Closed)) => break,
                Ok(Err(error)) => {
                    tracing::warn!(%error, "error receiving datagram");
                    continue;
                }
                Err(_) => continue,
            };
            buffer.set_len(size);

            // Unknown-peer policy: without an existing session and without
            // the accept flag, traffic from strangers is invisible.
            if !self.peers.contains_key(&from) && !self.config.accept_unknown_peers {
                tracing::trace!(peer = %from, "ignoring datagram from unknown peer");
                continue;
            }

            let now = Instant::now();
            let session = self.session_for(from, now);
            let outputs = {
                let mut session = session.lock().await;
                session.handle_datagram(buffer, now)
            };
            self.execute_outputs(from, outputs, now).await;
        }
        tracing::debug!("receive loop stopped");
    }

    async fn tap_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let mut buffer = match self.pool.allocate() {
                Ok(buffer) => buffer,
                Err(error) => {
                    tracing::warn!(%error, "tap read stalled: no buffer");
                    tokio::time::sleep(RECV_POLL).await;
                    continue;
                }
            };
            let read = tokio::time::timeout(RECV_POLL, self.tap.read_frame(buffer.block_mut()))
                .await;
            let size = match read {
                Ok(Ok(size)) => size,
                Ok(Err(_)) => break,
                Err(_) => continue,
            };
            buffer.set_len(size);

            let now = Instant::now();
            let dispatch = match self.router.lock() {
                Ok(mut router) => router.classify_outbound(buffer.as_slice(), now),
                Err(_) => break,
            };
            self.send_frame_to(dispatch, buffer.as_slice(), None, now)
                .await;
        }
        tracing::debug!("tap loop stopped");
    }

    async fn timer_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let now = Instant::now();

            let sessions: Vec<(SocketAddr, Arc<Mutex<PeerSession>>)> = self
                .peers
                .iter()
                .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                .collect();

            let mut dead = Vec::new();
            for (addr, session) in sessions {
                let (outputs, defunct) = {
                    let mut session = session.lock().await;
                    let outputs = session.poll_timers(now);
                    (outputs, session.defunct())
                };
                self.execute_outputs(addr, outputs, now).await;
                if defunct.is_some() {
                    dead.push(addr);
                }
            }
            for addr in dead {
                self.remove_peer(addr);
            }
            if let Ok(mut router) = self.router.lock() {
                router.purge_expired(now);
            }
        }
        tracing::debug!("timer loop stopped");
    }

    fn remove_peer(&self, addr: SocketAddr) {
        self.peers.remove(&addr);
        self.by_hash.retain(|_, peer| *peer != addr);
        if let Ok(mut router) = self.router.lock() {
            router.peer_removed(addr);
        }
        tracing::debug!(peer = %addr, "peer session removed");
    }

    /// Execute the commands a session handler returned, after its lock has
    /// been released.
    async fn execute_outputs(self: &Arc<Self>, from: SocketAddr, outputs: Vec<Output>, now: Instant) {
        for output in outputs {
            match output {
                Output::Transmit { datagram, class } => {
                    self.transmit(from, datagram.as_slice(), class).await;
                }
                Output::Deliver { channel: _, datagram } => {
                    let frame = &datagram.as_slice()[DATA_PAYLOAD_OFFSET..];
                    let dispatch = match self.router.lock() {
                        Ok(mut router) => router.classify_inbound(frame, from, now),
                        Err(_) => continue,
                    };
                    if dispatch.to_tap {
                        if let Err(error) = self.tap.write_frame(frame).await {
                            tracing::debug!(%error, "tap write failed");
                        }
                    }
                    if dispatch.relay != Dispatch::None {
                        self.send_frame_to(dispatch.relay, frame, Some(from), now).await;
                    }
                }
                Output::Event(event) => {
                    self.handle_event(&event, now).await;
                    let _ = self.events_tx.send(event).await;
                }
                Output::GreetAddress(addr) => {
                    // Introductions greet in the background; failures show
                    // up as HelloCompleted events.
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        inner.background_greet(addr).await;
                    });
                }
                Output::ContactLookup(hashes) => {
                    self.answer_contact_request(from, hashes, now).await;
                }
                Output::HelloResult {
                    unique_number,
                    rtt,
                    success,
                } => {
                    if let Some((_, tx)) =
                        self.pending_greets.remove(&(from, unique_number))
                    {
                        let outcome = match (success, rtt) {
                            (true, Some(rtt)) => Ok(rtt),
                            _ => Err(SessionError::TimedOut),
                        };
                        let _ = tx.send(outcome);
                    }
                }
            }
        }
    }

    async fn transmit(&self, addr: SocketAddr, datagram: &[u8], class: MessageClass) {
        match class {
            MessageClass::Control => {
                if let Err(error) = self.transport.send_to(datagram, addr).await {
                    tracing::warn!(peer = %addr, %error, "control send failed");
                }
            }
            MessageClass::Data => match self.transport.try_send_to(datagram, addr) {
                Ok(_) => {}
                Err(TransportError::QueueFull) => {
                    tracing::trace!(peer = %addr, "data datagram dropped on backpressure");
                }
                Err(error) => {
                    tracing::debug!(peer = %addr, %error, "data send failed");
                }
            },
        }
    }

    /// Encrypt and send a plaintext frame to the peers a dispatch names.
    async fn send_frame_to(
        self: &Arc<Self>,
        dispatch: Dispatch,
        frame: &[u8],
        exclude: Option<SocketAddr>,
        now: Instant,
    ) {
        let targets: Vec<SocketAddr> = match dispatch {
            Dispatch::None => return,
            Dispatch::Unicast(addr) => vec![addr],
            Dispatch::Flood => self
                .peers
                .iter()
                .filter(|entry| Some(*entry.key()) != exclude)
                .map(|entry| *entry.key())
                .collect(),
        };

        for addr in targets {
            let Some(session) = self.peers.get(&addr).map(|s| Arc::clone(&s)) else {
                continue;
            };
            let outputs = {
                let mut session = session.lock().await;
                if !session.is_established() {
                    continue;
                }
                session.send_frame(frame, 0, now)
            };
            self.transmit_outputs(addr, outputs).await;
        }
    }

    /// Execute outputs that can only be transmissions (data sends, contact
    /// replies, rekey kick-offs). Keeps the helper paths out of the general
    /// output executor so the async call graph stays acyclic.
    async fn transmit_outputs(&self, addr: SocketAddr, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Transmit { datagram, class } => {
                    self.transmit(addr, datagram.as_slice(), class).await;
                }
                Output::Event(event) => {
                    let _ = self.events_tx.send(event).await;
                }
                other => {
                    tracing::debug!(?other, "unexpected output on transmit-only path");
                }
            }
        }
    }

    /// Serve a CONTACT_REQUEST: introduce every requested peer we know and
    /// still believe reachable; remember the rest in case they show up.
    async fn answer_contact_request(
        self: &Arc<Self>,
        from: SocketAddr,
        hashes: Vec<CertificateHash>,
        now: Instant,
    ) {
        let mut entries = Vec::new();
        let mut unknown = Vec::new();
        for hash in hashes {
            let Some(addr) = self.by_hash.get(&hash).map(|entry| *entry.value()) else {
                unknown.push(hash);
                continue;
            };
            let fresh = match self.peers.get(&addr).map(|s| Arc::clone(&s)) {
                Some(session) => {
                    let session = session.lock().await;
                    session.is_established()
                        && now.duration_since(session.last_receive_at())
                            < self.config.contact_validity
                }
                None => false,
            };
            if fresh {
                entries.push((hash, addr));
            } else {
                unknown.push(hash);
            }
        }

        let Some(session) = self.peers.get(&from).map(|s| Arc::clone(&s)) else {
            return;
        };
        let outputs = {
            let mut session = session.lock().await;
            session.remember_contact_interest(unknown);
            session.send_contact_reply(&entries, now)
        };
        self.transmit_outputs(from, outputs).await;
    }

    /// React to events before they reach the operator.
    async fn handle_event(self: &Arc<Self>, event: &EndpointEvent, now: Instant) {
        match event {
            EndpointEvent::PeerEstablished {
                addr,
                certificate_hash: Some(hash),
            } => {
                self.by_hash.insert(*hash, *addr);
                self.serve_pending_contacts(*hash, *addr, now).await;
            }
            EndpointEvent::PeerLost { addr, reason } => {
                if *reason != LossReason::Closed {
                    self.remove_peer(*addr);
                }
            }
            _ => {}
        }
    }

    /// A peer with `hash` just became reachable; introduce it to everyone
    /// who asked for it while it was unknown.
    async fn serve_pending_contacts(
        self: &Arc<Self>,
        hash: CertificateHash,
        addr: SocketAddr,
        now: Instant,
    ) {
        let sessions: Vec<(SocketAddr, Arc<Mutex<PeerSession>>)> = self
            .peers
            .iter()
            .filter(|entry| *entry.key() != addr)
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        for (peer_addr, session) in sessions {
            let outputs = {
                let mut session = session.lock().await;
                if !session.take_contact_interest(&hash) {
                    continue;
                }
                session.send_contact_reply(&[(hash, addr)], now)
            };
            self.transmit_outputs(peer_addr, outputs).await;
        }
    }

    async fn background_greet(self: &Arc<Self>, addr: SocketAddr) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let session = self.session_for(addr, now);
        let greeted = {
            let mut session = session.lock().await;
            session.greet(now)
        };
        match greeted {
            Ok((_, outputs)) => self.transmit_outputs(addr, outputs).await,
            Err(error) => {
                tracing::debug!(peer = %addr, %error, "background greet failed");
            }
        }
    }
}
