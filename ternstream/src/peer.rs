//! Application-facing connection handle.
//!
//! A [`Peer`] is shared between the application and the I/O thread. The
//! application reads its state and queues outbound data; only the I/O thread
//! changes its state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use terntrust::Key;
use tracing::debug;

use crate::channel::Outbound;
use crate::error::{Result, TernStreamError};
use crate::handshake::ConnectionMode;
use crate::ordinal::Ordinal;
use crate::transport::Delivery;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerState {
    Connecting = 0,
    Connected = 1,
    /// Flushing outstanding data before closing.
    Disconnecting = 2,
    Disconnected = 3,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Connecting,
            1 => PeerState::Connected,
            2 => PeerState::Disconnecting,
            _ => PeerState::Disconnected,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "Connecting"),
            PeerState::Connected => write!(f, "Connected"),
            PeerState::Disconnecting => write!(f, "Disconnecting"),
            PeerState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Why a peer was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerReason {
    /// Closed locally.
    Closed = 0,
    /// The remote closed or reset the connection.
    Reset = 1,
    /// The remote stopped answering.
    TimedOut = 2,
    /// A protocol or handshake error.
    Error = 3,
    /// The remote refused the connection.
    Refused = 4,
    /// Connection attempts went unanswered.
    Unreachable = 5,
}

const NO_REASON: u8 = u8::MAX;

impl PeerReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PeerReason::Closed),
            1 => Some(PeerReason::Reset),
            2 => Some(PeerReason::TimedOut),
            3 => Some(PeerReason::Error),
            4 => Some(PeerReason::Refused),
            5 => Some(PeerReason::Unreachable),
            _ => None,
        }
    }
}

impl fmt::Display for PeerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Traffic counters, updated by the I/O thread.
#[derive(Debug, Default)]
pub struct PeerStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    retransmissions: AtomicU64,
    fast_retransmissions: AtomicU64,
    dropped: AtomicU64,
}

impl PeerStats {
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Segments sent again, on a timer or an acknowledgement.
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.load(Ordering::Relaxed)
    }

    /// Retransmissions triggered by acknowledgements reporting a gap.
    pub fn fast_retransmissions(&self) -> u64 {
        self.fast_retransmissions.load(Ordering::Relaxed)
    }

    /// Datagrams that failed to decode or authenticate.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmissions(&self, count: usize, fast: usize) {
        self.retransmissions.fetch_add(count as u64, Ordering::Relaxed);
        self.fast_retransmissions.fetch_add(fast as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

struct PeerInner {
    endpoint: SocketAddr,
    session: u32,
    mode: ConnectionMode,
    state: AtomicU8,
    reason: AtomicU8,
    mtu: AtomicU16,
    max_payload: AtomicUsize,
    max_message: AtomicUsize,
    rtt_micros: AtomicU64,
    close_requested: AtomicBool,
    terminated: AtomicBool,
    /// The only public key the remote may answer with.
    pinned_key: Option<Key>,
    outbound: OnceLock<Vec<Mutex<Outbound>>>,
    stats: PeerStats,
}

/// A connection to a remote host. Cloning is cheap; clones refer to the
/// same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub(crate) fn new(endpoint: SocketAddr, session: u32, mode: ConnectionMode) -> Self {
        Self::build(endpoint, session, mode, None)
    }

    /// A secure peer that must prove it holds the private half of `key`.
    pub(crate) fn with_pinned_key(endpoint: SocketAddr, session: u32, key: Key) -> Self {
        Self::build(endpoint, session, ConnectionMode::Secure, Some(key))
    }

    fn build(endpoint: SocketAddr, session: u32, mode: ConnectionMode, pinned_key: Option<Key>) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                endpoint,
                session,
                mode,
                state: AtomicU8::new(PeerState::Connecting as u8),
                reason: AtomicU8::new(NO_REASON),
                mtu: AtomicU16::new(0),
                max_payload: AtomicUsize::new(0),
                max_message: AtomicUsize::new(0),
                rtt_micros: AtomicU64::new(0),
                close_requested: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                pinned_key,
                outbound: OnceLock::new(),
                stats: PeerStats::default(),
            }),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    /// Identifier chosen by the initiator for this connection.
    pub fn session(&self) -> u32 {
        self.inner.session
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn mode(&self) -> ConnectionMode {
        self.inner.mode
    }

    /// Why the peer was disconnected, once it has been.
    pub fn reason(&self) -> Option<PeerReason> {
        PeerReason::from_u8(self.inner.reason.load(Ordering::Acquire))
    }

    /// Negotiated channel count, zero until connected.
    pub fn channels(&self) -> u8 {
        self.inner.outbound.get().map_or(0, |c| c.len() as u8)
    }

    /// Negotiated MTU, zero until connected.
    pub fn mtu(&self) -> u16 {
        self.inner.mtu.load(Ordering::Relaxed)
    }

    /// Largest payload one segment carries, zero until connected. The
    /// unreliable and semireliable lanes accept nothing larger.
    pub fn max_payload(&self) -> usize {
        self.inner.max_payload.load(Ordering::Relaxed)
    }

    /// Largest reliable message, sent as fragments when above
    /// [`max_payload`](Self::max_payload). Zero until connected.
    pub fn max_message(&self) -> usize {
        self.inner.max_message.load(Ordering::Relaxed)
    }

    /// The public key the remote was required to present, if any.
    pub fn pinned_key(&self) -> Option<&Key> {
        self.inner.pinned_key.as_ref()
    }

    /// Smoothed round-trip time, once measured.
    pub fn rtt(&self) -> Option<Duration> {
        match self.inner.rtt_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn stats(&self) -> &PeerStats {
        &self.inner.stats
    }

    /// Queue `payload` on channel 0.
    pub fn send(&self, payload: impl Into<Bytes>, delivery: Delivery) -> Result<Ordinal> {
        self.send_on(0, payload, delivery)
    }

    /// Queue `payload` on `channel`, returning the ordinal it was assigned
    /// on that channel's `delivery` lane.
    ///
    /// Fails immediately when the peer is not connected, the payload is
    /// larger than the lane takes, or the channel's backlog is full.
    pub fn send_on(
        &self,
        channel: u8,
        payload: impl Into<Bytes>,
        delivery: Delivery,
    ) -> Result<Ordinal> {
        let max = match delivery {
            Delivery::Reliable => self.max_message(),
            _ => self.max_payload(),
        };
        let (lane, payload) = self.lane_for(channel, payload.into(), max)?;
        lane.lock().send(delivery, payload)
    }

    /// Queue an unreliable `payload` on channel 0 that is dropped unsent
    /// if `time_limit` passes before its turn on the wire.
    pub fn send_volatile(&self, payload: impl Into<Bytes>, time_limit: Duration) -> Result<Ordinal> {
        self.send_volatile_on(0, payload, time_limit)
    }

    pub fn send_volatile_on(
        &self,
        channel: u8,
        payload: impl Into<Bytes>,
        time_limit: Duration,
    ) -> Result<Ordinal> {
        let (lane, payload) = self.lane_for(channel, payload.into(), self.max_payload())?;
        lane.lock().send_volatile(payload, Instant::now() + time_limit)
    }

    fn lane_for(&self, channel: u8, payload: Bytes, max: usize) -> Result<(&Mutex<Outbound>, Bytes)> {
        if self.state() != PeerState::Connected {
            return Err(TernStreamError::NotConnected);
        }
        let outbound = self.inner.outbound.get().ok_or(TernStreamError::NotConnected)?;
        let lane = outbound
            .get(usize::from(channel))
            .ok_or(TernStreamError::UnknownChannel {
                channel,
                channels: outbound.len() as u8,
            })?;
        if payload.len() > max {
            return Err(TernStreamError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        Ok((lane, payload))
    }

    /// Ask the I/O thread to close the connection once queued reliable data
    /// has been delivered. The peer reports [`PeerReason::Closed`].
    pub fn close(&self) {
        if !self.inner.close_requested.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint(), "close requested");
        }
    }

    /// Drop the connection without flushing: queued data is discarded and
    /// the remote is reset. Data already received but not yet read is
    /// withheld; the next event for this peer is its disconnection with
    /// [`PeerReason::Closed`].
    pub fn terminate(&self) {
        if !self.inner.terminated.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint(), "termination requested");
        }
        self.inner.close_requested.store(true, Ordering::Release);
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn outbound(&self) -> &[Mutex<Outbound>] {
        self.inner.outbound.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Install the negotiated channels and mark the peer connected.
    pub(crate) fn establish(
        &self,
        mtu: u16,
        max_payload: usize,
        max_message: usize,
        outbound: Vec<Mutex<Outbound>>,
    ) {
        self.inner.mtu.store(mtu, Ordering::Relaxed);
        self.inner.max_payload.store(max_payload, Ordering::Relaxed);
        self.inner.max_message.store(max_message.max(max_payload), Ordering::Relaxed);
        if self.inner.outbound.set(outbound).is_err() {
            debug!(endpoint = %self.endpoint(), "channels already installed");
        }
        self.set_state(PeerState::Connected);
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        let previous = self.inner.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(
                endpoint = %self.endpoint(),
                from = %PeerState::from_u8(previous),
                to = %state,
                "peer state changed"
            );
        }
    }

    pub(crate) fn disconnect(&self, reason: PeerReason) {
        self.inner.reason.store(reason as u8, Ordering::Release);
        self.set_state(PeerState::Disconnected);
    }

    pub(crate) fn set_rtt(&self, rtt: Duration) {
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX).max(1);
        self.inner.rtt_micros.store(micros, Ordering::Relaxed);
    }

    pub(crate) fn ptr_eq(&self, other: &Peer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("endpoint", &self.endpoint())
            .field("session", &format_args!("{:08x}", self.session()))
            .field("mode", &self.mode())
            .field("state", &self.state())
            .finish()
    }
}
