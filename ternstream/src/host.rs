//! The host: one UDP socket, its peers, and the I/O thread driving them.
//!
//! The application talks to the I/O thread through two lock-free queues:
//! connect requests flow in, events flow out. Everything else the thread
//! owns outright (socket, memory pool, reordering state). Outbound channel
//! backlogs are the only state both sides touch, behind per-channel locks.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rand::Rng;
use terntrust::{Key, KeyAgreement, X25519};
use tracing::{debug, error, trace, warn};

use crate::connection::{Connection, Io};
use crate::error::{Result, TernStreamError};
use crate::event::Event;
use crate::handshake::{ConnectionMode, ConnectionTypes};
use crate::interceptor::Interceptor;
use crate::memory::MemoryPool;
use crate::packet::{Offer, Packet};
use crate::peer::{Peer, PeerReason};
use crate::settings::Settings;
use crate::socket;

/// State shared between the application and the I/O thread.
struct Shared {
    events: Arc<SegQueue<Event>>,
    connects: SegQueue<Peer>,
    shutdown: AtomicBool,
    fatal: Mutex<Option<TernStreamError>>,
}

struct Running {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// A UDP endpoint accepting and initiating connections.
///
/// ```no_run
/// use ternstream::{ConnectionTypes, Delivery, Event, Host, Settings};
///
/// let mut host = Host::new();
/// host.open("0.0.0.0:7777".parse().unwrap(), Settings::default(), ConnectionTypes::ALL)?;
/// loop {
///     while let Some(event) = host.try_get_event()? {
///         if let Event::Data { peer, payload, .. } = event {
///             peer.send(payload, Delivery::Reliable)?;
///         }
///     }
///     std::thread::sleep(std::time::Duration::from_millis(1));
/// }
/// # Ok::<(), ternstream::TernStreamError>(())
/// ```
pub struct Host {
    agreement: Arc<dyn KeyAgreement>,
    identity: Option<Key>,
    interceptor: Option<Box<dyn Interceptor>>,
    running: Option<Running>,
    peers: HashMap<SocketAddr, Peer>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            agreement: Arc::new(X25519),
            identity: None,
            interceptor: None,
            running: None,
            peers: HashMap::new(),
        }
    }

    /// Use `agreement` for the key exchange of secure connections.
    pub fn with_key_agreement(mut self, agreement: Arc<dyn KeyAgreement>) -> Self {
        self.agreement = agreement;
        self
    }

    /// Offer the public half of `private_key` in every secure handshake
    /// instead of a fresh key, so remotes can pin it with
    /// [`connect_with_key`](Self::connect_with_key).
    pub fn with_private_key(mut self, private_key: Key) -> Self {
        self.identity = Some(private_key);
        self
    }

    /// The public key remotes see from this host, when it has an identity.
    pub fn public_key(&self) -> Option<Key> {
        self.identity
            .as_ref()
            .map(|private_key| self.agreement.create_public_key(private_key))
    }

    /// Route every datagram through `interceptor`. It moves to the I/O
    /// thread on the next `open`.
    pub fn with_interceptor(mut self, interceptor: Box<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    /// Bind `addr` and start the I/O thread. Initiators may connect with any
    /// mode in `types`.
    pub fn open(&mut self, addr: SocketAddr, settings: Settings, types: ConnectionTypes) -> Result<()> {
        if self.running.is_some() {
            return Err(TernStreamError::AlreadyOpen);
        }
        let settings = Arc::new(settings.validated());
        let socket = socket::bind(addr, &settings)?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(Shared {
            events: Arc::new(SegQueue::new()),
            connects: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });
        let worker = Worker {
            socket,
            types,
            interceptor: self.interceptor.take(),
            shared: Arc::clone(&shared),
            connections: HashMap::new(),
            io: Io {
                settings: Arc::clone(&settings),
                agreement: Arc::clone(&self.agreement),
                identity: self.identity.clone(),
                events: Arc::clone(&shared.events),
                pool: MemoryPool::new(),
                outgoing: Vec::new(),
            },
        };
        let thread = thread::Builder::new()
            .name(format!("ternstream-io-{}", local_addr.port()))
            .spawn(move || worker.run_guarded())?;

        debug!(%local_addr, ?types, capacity = settings.capacity, "host opened");
        self.running = Some(Running {
            shared,
            thread: Some(thread),
            local_addr,
        });
        Ok(())
    }

    /// Start connecting to `remote`. The returned peer reports `Connecting`
    /// until a [`Event::Connection`] or [`Event::Disconnection`] for it.
    pub fn connect(&mut self, remote: SocketAddr, mode: ConnectionMode) -> Result<Peer> {
        self.start_connect(remote, |remote, session| Peer::new(remote, session, mode))
    }

    /// Connect securely to `remote`, which must answer with
    /// `remote_public_key`. Any other key ends the attempt with
    /// [`PeerReason::Error`].
    pub fn connect_with_key(&mut self, remote: SocketAddr, remote_public_key: Key) -> Result<Peer> {
        self.start_connect(remote, |remote, session| {
            Peer::with_pinned_key(remote, session, remote_public_key)
        })
    }

    fn start_connect(
        &mut self,
        remote: SocketAddr,
        build: impl FnOnce(SocketAddr, u32) -> Peer,
    ) -> Result<Peer> {
        let running = self.running.as_ref().ok_or(TernStreamError::NotOpen)?;
        let remote = socket::reachable(running.local_addr, remote)?;
        let session = rand::thread_rng().gen_range(1..=u32::MAX);
        let peer = build(remote, session);
        running.shared.connects.push(peer.clone());
        Ok(peer)
    }

    /// Take the next event without blocking.
    ///
    /// A failure of the I/O thread is returned once, after which the host
    /// is closed. Events still queued for a [terminated](Peer::terminate)
    /// peer are skipped up to its disconnection.
    pub fn try_get_event(&mut self) -> Result<Option<Event>> {
        let running = self.running.as_ref().ok_or(TernStreamError::NotOpen)?;
        let fatal = running.shared.fatal.lock().take();
        if let Some(err) = fatal {
            self.stop();
            return Err(err);
        }
        loop {
            let event = running.shared.events.pop();
            match &event {
                Some(Event::Connection(peer) | Event::Data { peer, .. }) if peer.is_terminated() => {
                    trace!(endpoint = %peer.endpoint(), "skipping event for terminated peer");
                    continue;
                }
                Some(Event::Connection(peer)) => {
                    self.peers.insert(peer.endpoint(), peer.clone());
                }
                Some(Event::Disconnection { peer, .. }) => {
                    if self.peers.get(&peer.endpoint()).is_some_and(|p| p == peer) {
                        self.peers.remove(&peer.endpoint());
                    }
                }
                _ => {}
            }
            return Ok(event);
        }
    }

    /// Peers whose `Connection` event has been taken and whose
    /// `Disconnection` event has not.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn peer(&self, endpoint: SocketAddr) -> Option<Peer> {
        self.peers.get(&endpoint).cloned()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.running
            .as_ref()
            .map(|r| r.local_addr)
            .ok_or(TernStreamError::NotOpen)
    }

    /// Stop the I/O thread and wait for it. Every peer ends up
    /// disconnected with [`PeerReason::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.running.is_none() {
            return Err(TernStreamError::NotOpen);
        }
        self.stop();
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = running.thread.take() {
            if thread.join().is_err() {
                warn!(local_addr = %running.local_addr, "I/O thread panicked during shutdown");
            }
        }
        self.peers.clear();
        debug!(local_addr = %running.local_addr, "host closed");
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the I/O thread.
struct Worker {
    socket: UdpSocket,
    types: ConnectionTypes,
    interceptor: Option<Box<dyn Interceptor>>,
    shared: Arc<Shared>,
    connections: HashMap<SocketAddr, Connection>,
    io: Io,
}

impl Worker {
    /// Run until shutdown, parking any failure or panic for the application.
    /// Every peer is disconnected with [`PeerReason::Error`] before the
    /// failure becomes visible.
    fn run_guarded(mut self) {
        let shared = Arc::clone(&self.shared);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run()));
        let err = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                TernStreamError::Fatal(format!("I/O thread panicked: {message}"))
            }
        };
        error!(%err, connections = self.connections.len(), "I/O thread stopped");
        let cleanup = panic::catch_unwind(AssertUnwindSafe(|| self.fail_all(PeerReason::Error)));
        if cleanup.is_err() {
            error!("I/O thread panicked while disconnecting peers");
        }
        *shared.fatal.lock() = Some(err);
    }

    fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; usize::from(u16::MAX)];
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                self.shutdown();
                return Ok(());
            }
            while let Some(peer) = self.shared.connects.pop() {
                self.connect(peer);
            }

            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.receive(from, &mut buf[..len]),
                Err(err) if socket::is_transient(&err) => {}
                Err(err) => return Err(err.into()),
            }

            self.service(Instant::now());
            self.flush();
        }
    }

    fn connect(&mut self, peer: Peer) {
        let now = Instant::now();
        if self.connections.contains_key(&peer.endpoint()) {
            warn!(endpoint = %peer.endpoint(), "already connected to endpoint");
            peer.disconnect(PeerReason::Error);
            self.io.events.push(Event::Disconnection {
                peer,
                reason: PeerReason::Error,
            });
            return;
        }
        let endpoint = peer.endpoint();
        match Connection::initiate(peer.clone(), now, &mut self.io) {
            Ok(conn) => {
                self.connections.insert(endpoint, conn);
            }
            Err(err) => {
                warn!(%endpoint, %err, "connect failed");
                peer.disconnect(PeerReason::Error);
                self.io.events.push(Event::Disconnection {
                    peer,
                    reason: PeerReason::Error,
                });
            }
        }
    }

    fn receive(&mut self, from: SocketAddr, data: &mut [u8]) {
        if let Some(interceptor) = self.interceptor.as_mut() {
            if !interceptor.on_receive(&from, data) {
                trace!(%from, len = data.len(), "datagram dropped by interceptor");
                return;
            }
        }
        let now = Instant::now();
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%from, %err, "dropping malformed datagram");
                if let Some(conn) = self.connections.get(&from) {
                    conn.peer().stats().record_dropped();
                }
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(&from) else {
            self.receive_unknown(from, packet, now);
            return;
        };
        if conn.session() == packet.session() {
            conn.peer().stats().record_received(data.len());
            if let ControlFlow::Break(reason) = conn.on_packet(packet, now, &mut self.io) {
                self.remove(from, reason);
            }
            return;
        }
        match packet {
            Packet::Connect { session, offer } => {
                debug!(%from, old = conn.session(), new = session, "endpoint reconnected");
                self.remove(from, PeerReason::Reset);
                self.accept(from, session, &offer, now);
            }
            other => {
                let err = TernStreamError::SessionMismatch {
                    expected: conn.session(),
                    actual: other.session(),
                };
                debug!(%from, %err, "dropping datagram");
                conn.peer().stats().record_dropped();
            }
        }
    }

    fn receive_unknown(&mut self, from: SocketAddr, packet: Packet, now: Instant) {
        match packet {
            Packet::Connect { session, offer } => self.accept(from, session, &offer, now),
            Packet::Confirm { session, .. } | Packet::Data { session, .. } => {
                trace!(%from, session, "data for unknown connection");
                self.reset(from, session);
            }
            Packet::Accept { .. } | Packet::Reset { .. } => {}
        }
    }

    fn accept(&mut self, from: SocketAddr, session: u32, offer: &Offer, now: Instant) {
        if session == 0 {
            return;
        }
        if self.connections.len() >= self.io.settings.capacity {
            let err = TernStreamError::HostFull(self.io.settings.capacity);
            debug!(%from, %err, "refusing connection");
            self.reset(from, session);
            return;
        }
        if !self.types.accepts(offer.mode) {
            debug!(%from, mode = ?offer.mode, accepted = ?self.types, "refusing connection mode");
            self.reset(from, session);
            return;
        }
        match Connection::accept(from, session, offer, now, &mut self.io) {
            Ok(conn) => {
                self.connections.insert(from, conn);
            }
            Err(err) => {
                warn!(%from, %err, "handshake failed");
                self.reset(from, session);
            }
        }
    }

    fn reset(&mut self, to: SocketAddr, session: u32) {
        let packet = Packet::reset(session);
        self.io.outgoing.push((to, packet.encode()));
    }

    fn remove(&mut self, endpoint: SocketAddr, reason: PeerReason) {
        if let Some(conn) = self.connections.remove(&endpoint) {
            conn.finish(reason, &mut self.io, true);
        }
    }

    fn service(&mut self, now: Instant) {
        let mut ended = Vec::new();
        for (endpoint, conn) in self.connections.iter_mut() {
            if let ControlFlow::Break(reason) = conn.update(now, &mut self.io) {
                ended.push((*endpoint, reason));
            }
        }
        for (endpoint, reason) in ended {
            self.remove(endpoint, reason);
        }
    }

    fn flush(&mut self) {
        for (to, bytes) in self.io.outgoing.drain(..) {
            let result = match self.interceptor.as_mut() {
                Some(interceptor) => {
                    let mut data = bytes.to_vec();
                    if !interceptor.on_send(&to, &mut data) {
                        trace!(%to, len = data.len(), "datagram dropped by interceptor");
                        continue;
                    }
                    self.socket.send_to(&data, to)
                }
                None => self.socket.send_to(&bytes, to),
            };
            if let Err(err) = result {
                debug!(%to, %err, "send failed");
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            conn.abort(&mut self.io);
            conn.finish(PeerReason::Closed, &mut self.io, false);
        }
        self.flush();
        while let Some(peer) = self.shared.connects.pop() {
            peer.disconnect(PeerReason::Closed);
        }
    }

    /// Drop every connection and pending connect without a word to the
    /// remotes.
    fn fail_all(&mut self, reason: PeerReason) {
        for (_, conn) in self.connections.drain() {
            conn.finish(reason, &mut self.io, false);
        }
        while let Some(peer) = self.shared.connects.pop() {
            peer.disconnect(reason);
        }
        self.io.outgoing.clear();
    }
}
