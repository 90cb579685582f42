//! Per-connection protocol state, owned by the I/O thread.
//!
//! A connection walks the handshake, then turns inbound packets into events
//! and outbound lane state into packets:
//!
//! ```text
//!   initiator: AwaitingAccept --Accept--> Established
//!   acceptor:  AwaitingConfirm --Confirm/Data--> Established
//! ```
//!
//! Handshake packets are repeated on the retransmission schedule until
//! answered. Every handler reports `ControlFlow::Break(reason)` when the
//! connection has to end; the host then calls [`Connection::finish`].

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use terntrust::{Key, KeyAgreement};
use tracing::{debug, trace, warn};

use crate::channel::{Inbound, Outbound};
use crate::congestion::cubic::Cubic;
use crate::congestion::CongestionController;
use crate::error::{Result, TernStreamError};
use crate::event::Event;
use crate::flow_control::FlowController;
use crate::frame::{Frame, SEGMENT_HEADER_LEN};
use crate::handshake::{ConnectionMode, KeyExchange, SecureSession};
use crate::memory::MemoryPool;
use crate::ordinal::Ordinal;
use crate::packet::{
    frame_budget, max_fragment, max_message, max_payload, Body, Offer, Packet, PacketKind,
};
use crate::peer::{Peer, PeerReason, PeerState};
use crate::rtt::RttEstimator;
use crate::settings::{Settings, MIN_MTU};
use crate::transport::{Delivery, Part, RetransmitTiming, TransmitContext, TransmitReport};

/// Resources the I/O thread lends to connections while they run.
pub struct Io {
    pub settings: Arc<Settings>,
    pub agreement: Arc<dyn KeyAgreement>,
    /// Long-lived private key offered instead of ephemeral ones.
    pub identity: Option<Key>,
    pub events: Arc<SegQueue<Event>>,
    pub pool: MemoryPool,
    /// Datagrams to write once the current step is done.
    pub outgoing: Vec<(SocketAddr, Bytes)>,
}

impl Io {
    fn send(&mut self, peer: &Peer, packet: &Packet) {
        let bytes = packet.encode();
        peer.stats().record_sent(bytes.len());
        self.outgoing.push((peer.endpoint(), bytes));
    }
}

#[derive(Debug)]
enum Phase {
    /// Initiator waiting for Accept. Holds the key exchange of secure
    /// connections.
    AwaitingAccept(Option<KeyExchange>),
    /// Acceptor waiting for the first authenticated packet.
    AwaitingConfirm,
    Established,
}

/// Repetition schedule for handshake and Close packets.
#[derive(Debug, Clone, Copy)]
struct Retry {
    last: Instant,
    attempts: u32,
}

impl Retry {
    fn new(now: Instant) -> Self {
        Self {
            last: now,
            attempts: 1,
        }
    }

    fn is_due(&self, now: Instant, timing: &RetransmitTiming) -> bool {
        now.saturating_duration_since(self.last) >= timing.delay(self.attempts)
    }

    fn record(&mut self, now: Instant) {
        self.last = now;
        self.attempts += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct Closing {
    started: Instant,
    close: Option<Retry>,
}

pub struct Connection {
    peer: Peer,
    /// Whether the application knows this peer, so that its end must be
    /// reported.
    announced: bool,
    phase: Phase,
    secure: Option<SecureSession>,
    /// Encoded Connect or Accept, repeated until answered.
    handshake: Bytes,
    retry: Retry,
    mtu: u16,
    channels: u8,
    inbound: Vec<Inbound>,
    flow: FlowController,
    rtt: RttEstimator,
    cubic: Cubic,
    last_received: Instant,
    last_sent: Instant,
    closing: Option<Closing>,
}

impl Connection {
    /// Start an outbound connection for `peer`, queueing its Connect.
    pub fn initiate(peer: Peer, now: Instant, io: &mut Io) -> Result<Self> {
        let (exchange, public_key) = match peer.mode() {
            ConnectionMode::Secure => {
                let (exchange, key) = KeyExchange::initiate(io.agreement.as_ref(), io.identity.as_ref())?;
                (Some(exchange), Some(key))
            }
            ConnectionMode::Insecure => (None, None),
        };
        let connect = Packet::Connect {
            session: peer.session(),
            offer: local_offer(&io.settings, peer.mode(), public_key),
        };
        let handshake = connect.encode();
        debug!(endpoint = %peer.endpoint(), session = peer.session(), mode = ?peer.mode(), "connecting");

        let mut conn = Self::new(peer, true, Phase::AwaitingAccept(exchange), handshake, now, &io.settings);
        conn.send_handshake(now, io);
        Ok(conn)
    }

    /// Answer a Connect from `endpoint`, queueing the Accept.
    pub fn accept(
        endpoint: SocketAddr,
        session: u32,
        offer: &Offer,
        now: Instant,
        io: &mut Io,
    ) -> Result<Self> {
        let peer = Peer::new(endpoint, session, offer.mode);
        let (public_key, secure) = match (offer.mode, &offer.public_key) {
            (ConnectionMode::Secure, Some(remote)) => {
                let (key, secure) = KeyExchange::accept(io.agreement.as_ref(), io.identity.as_ref(), remote, session)?;
                (Some(key), Some(secure))
            }
            (ConnectionMode::Secure, None) => {
                return Err(TernStreamError::HandshakeFailed("missing public key".into()))
            }
            (ConnectionMode::Insecure, _) => (None, None),
        };
        let accept = Packet::Accept {
            session,
            offer: local_offer(&io.settings, offer.mode, public_key),
        };
        let handshake = accept.encode();
        debug!(%endpoint, session, mode = ?offer.mode, "accepting connection");

        let mut conn = Self::new(peer, false, Phase::AwaitingConfirm, handshake, now, &io.settings);
        conn.secure = secure;
        conn.negotiate(offer, &io.settings);
        conn.send_handshake(now, io);
        Ok(conn)
    }

    fn new(
        peer: Peer,
        announced: bool,
        phase: Phase,
        handshake: Bytes,
        now: Instant,
        settings: &Settings,
    ) -> Self {
        let secure = peer.mode().is_secure();
        Self {
            peer,
            announced,
            phase,
            secure: None,
            handshake,
            retry: Retry::new(now),
            mtu: settings.mtu,
            channels: settings.max_channels,
            inbound: Vec::new(),
            flow: FlowController::new(settings.downstream.window),
            rtt: RttEstimator::with_min_rto(settings.resend_timeout),
            cubic: Cubic::new(
                max_payload(settings.mtu, secure) + SEGMENT_HEADER_LEN,
                settings.upstream.window,
                settings.upstream.loss,
            ),
            last_received: now,
            last_sent: now,
            closing: None,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn session(&self) -> u32 {
        self.peer.session()
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    /// Adopt the remote's parameters.
    fn negotiate(&mut self, remote: &Offer, settings: &Settings) {
        self.mtu = settings.mtu.min(remote.mtu).max(MIN_MTU);
        self.channels = settings.max_channels.min(remote.channels).max(1);
        let window = (remote.window as usize).max(usize::from(self.mtu));
        let loss = settings.upstream.loss.min(remote.loss_ratio());
        let mss = max_payload(self.mtu, remote.mode.is_secure()) + SEGMENT_HEADER_LEN;
        self.cubic = Cubic::new(mss, window, loss);
        trace!(
            endpoint = %self.peer.endpoint(),
            mtu = self.mtu,
            channels = self.channels,
            window,
            loss,
            "negotiated"
        );
    }

    fn timing(&self, settings: &Settings) -> RetransmitTiming {
        RetransmitTiming {
            rto: self.rtt.rto(),
            backoff: settings.ack_backoff,
            fail_limit: u32::from(settings.ack_fail_limit),
        }
    }

    fn establish(&mut self, now: Instant, io: &mut Io) {
        let window = io.settings.upstream.window;
        let secure = self.peer.mode().is_secure();
        let (segment, fragment) = (max_payload(self.mtu, secure), max_fragment(self.mtu, secure));
        let outbound = (0..self.channels)
            .map(|channel| Mutex::new(Outbound::new(channel, window, segment, fragment)))
            .collect();
        self.inbound = (0..self.channels).map(Inbound::new).collect();
        self.peer
            .establish(self.mtu, segment, max_message(self.mtu, secure), outbound);
        self.phase = Phase::Established;
        self.announced = true;
        self.last_received = now;
        debug!(
            endpoint = %self.peer.endpoint(),
            session = self.session(),
            channels = self.channels,
            mtu = self.mtu,
            "connection established"
        );
        io.events.push(Event::Connection(self.peer.clone()));
    }

    /// Process a packet whose session matches this connection.
    pub fn on_packet(&mut self, packet: Packet, now: Instant, io: &mut Io) -> ControlFlow<PeerReason> {
        match packet {
            Packet::Connect { .. } => {
                if matches!(self.phase, Phase::AwaitingConfirm) {
                    self.last_received = now;
                    self.send_handshake(now, io);
                }
                ControlFlow::Continue(())
            }
            Packet::Accept { offer, .. } => self.on_accept(offer, now, io),
            Packet::Reset { body, .. } => self.on_reset(body, now),
            Packet::Confirm { body, .. } => self.on_body(PacketKind::Confirm, body, now, io),
            Packet::Data { body, .. } => self.on_body(PacketKind::Data, body, now, io),
        }
    }

    fn on_accept(&mut self, offer: Offer, now: Instant, io: &mut Io) -> ControlFlow<PeerReason> {
        if !matches!(self.phase, Phase::AwaitingAccept(_)) {
            if self.is_established() && self.peer.state() == PeerState::Connected {
                // Our Confirm was lost.
                self.last_received = now;
                self.send_frames(PacketKind::Confirm, vec![Frame::Ping], now, io);
            }
            return ControlFlow::Continue(());
        }
        let exchange = match &mut self.phase {
            Phase::AwaitingAccept(exchange) => exchange.take(),
            _ => None,
        };
        self.last_received = now;

        if offer.mode != self.peer.mode() {
            warn!(
                endpoint = %self.peer.endpoint(),
                requested = ?self.peer.mode(),
                answered = ?offer.mode,
                "connection mode mismatch"
            );
            return ControlFlow::Break(PeerReason::Error);
        }
        if let Some(pinned) = self.peer.pinned_key() {
            if offer.public_key.as_ref() != Some(pinned) {
                warn!(
                    endpoint = %self.peer.endpoint(),
                    expected = ?pinned,
                    answered = ?offer.public_key,
                    "remote key does not match the pinned key"
                );
                return ControlFlow::Break(PeerReason::Error);
            }
        }
        if let (Some(exchange), Some(remote)) = (exchange, &offer.public_key) {
            match exchange.complete(io.agreement.as_ref(), remote, self.session()) {
                Ok(secure) => self.secure = Some(secure),
                Err(err) => {
                    warn!(endpoint = %self.peer.endpoint(), %err, "key agreement failed");
                    return ControlFlow::Break(PeerReason::Error);
                }
            }
        } else if self.peer.mode().is_secure() {
            return ControlFlow::Break(PeerReason::Error);
        }

        let settings = Arc::clone(&io.settings);
        self.negotiate(&offer, &settings);
        self.establish(now, io);
        self.send_frames(PacketKind::Confirm, vec![Frame::Ping], now, io);
        ControlFlow::Continue(())
    }

    /// Refusals are taken on trust, since no keys exist yet. Afterwards a
    /// secure connection only ends on a Reset that opens.
    fn on_reset(&mut self, body: Body, now: Instant) -> ControlFlow<PeerReason> {
        if matches!(self.phase, Phase::AwaitingAccept(_)) {
            self.last_received = now;
            return ControlFlow::Break(PeerReason::Refused);
        }
        if body.is_sealed() != self.peer.mode().is_secure() {
            self.drop_datagram(&TernStreamError::HandshakeFailed("unauthenticated reset".into()));
            return ControlFlow::Continue(());
        }
        let session = self.session();
        if let Err(err) = body.open(self.secure.as_mut(), PacketKind::Reset, session) {
            self.drop_datagram(&err);
            return ControlFlow::Continue(());
        }
        self.last_received = now;
        ControlFlow::Break(PeerReason::Reset)
    }

    fn on_body(&mut self, kind: PacketKind, body: Body, now: Instant, io: &mut Io) -> ControlFlow<PeerReason> {
        if matches!(self.phase, Phase::AwaitingAccept(_)) {
            return ControlFlow::Continue(());
        }
        if body.is_sealed() != self.peer.mode().is_secure() {
            self.drop_datagram(&TernStreamError::HandshakeFailed("protection mode mismatch".into()));
            return ControlFlow::Continue(());
        }
        let session = self.session();
        let frames = match body.open(self.secure.as_mut(), kind, session) {
            Ok(frames) => frames,
            Err(err) => {
                self.drop_datagram(&err);
                return ControlFlow::Continue(());
            }
        };
        self.last_received = now;
        if matches!(self.phase, Phase::AwaitingConfirm) {
            self.establish(now, io);
        }

        for frame in frames {
            match frame {
                Frame::Segment {
                    channel,
                    delivery,
                    ordinal,
                    base,
                    part,
                    payload,
                } => self.on_segment(channel, delivery, ordinal, base, part, payload, io),
                Frame::Ack {
                    channel,
                    delivery,
                    next,
                    bits,
                } => self.on_ack(channel, delivery, next, bits, now),
                Frame::Ping => {}
                Frame::Close => {
                    self.send_frames(PacketKind::Data, vec![Frame::CloseAck], now, io);
                    return ControlFlow::Break(PeerReason::Reset);
                }
                Frame::CloseAck => {
                    if self.closing.is_some() {
                        return ControlFlow::Break(PeerReason::Closed);
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_segment(
        &mut self,
        channel: u8,
        delivery: Delivery,
        ordinal: Ordinal,
        base: Ordinal,
        part: Part,
        payload: Bytes,
        io: &mut Io,
    ) {
        let Some(inbound) = self.inbound.get_mut(usize::from(channel)) else {
            debug!(
                endpoint = %self.peer.endpoint(),
                err = %TernStreamError::UnknownChannel { channel, channels: self.channels },
                "dropping segment"
            );
            return;
        };
        match inbound.receive(delivery, ordinal, base, part, payload, &mut io.pool, &mut self.flow) {
            Ok(delivered) => {
                for payload in delivered {
                    io.events.push(Event::Data {
                        peer: self.peer.clone(),
                        channel,
                        delivery,
                        payload,
                    });
                }
            }
            Err(err) => debug!(endpoint = %self.peer.endpoint(), %err, "dropping segment"),
        }
    }

    fn on_ack(
        &mut self,
        channel: u8,
        delivery: Delivery,
        next: Ordinal,
        bits: u32,
        now: Instant,
    ) {
        let Some(outbound) = self.peer.outbound().get(usize::from(channel)) else {
            debug!(endpoint = %self.peer.endpoint(), channel, "ack for unknown channel");
            return;
        };
        let outcome = outbound.lock().on_ack(delivery, next, bits, now);
        if outcome.acked_bytes > 0 {
            self.cubic.on_ack(outcome.acked_bytes);
        }
        if let Some(sample) = outcome.rtt_sample {
            self.rtt.update(sample);
            if let Some(srtt) = self.rtt.srtt() {
                self.peer.set_rtt(srtt);
            }
        }
    }

    fn drop_datagram(&self, err: &TernStreamError) {
        debug!(endpoint = %self.peer.endpoint(), %err, "dropping datagram");
        self.peer.stats().record_dropped();
    }

    /// Drive timers and flush due frames.
    pub fn update(&mut self, now: Instant, io: &mut Io) -> ControlFlow<PeerReason> {
        let settings = Arc::clone(&io.settings);
        let silent = now.saturating_duration_since(self.last_received);

        if self.peer.is_terminated() {
            self.abort(io);
            return ControlFlow::Break(PeerReason::Closed);
        }
        if !self.is_established() {
            if self.peer.close_requested() {
                return ControlFlow::Break(PeerReason::Closed);
            }
            let unanswered = match self.phase {
                Phase::AwaitingAccept(_) => PeerReason::Unreachable,
                _ => PeerReason::TimedOut,
            };
            if silent >= settings.connection_timeout {
                return ControlFlow::Break(unanswered);
            }
            let timing = RetransmitTiming {
                rto: settings.resend_timeout,
                backoff: settings.ack_backoff,
                fail_limit: u32::from(settings.ack_fail_limit),
            };
            if self.retry.is_due(now, &timing) {
                if self.retry.attempts >= timing.fail_limit {
                    return ControlFlow::Break(unanswered);
                }
                self.retry.record(now);
                self.send_handshake(now, io);
            }
            return ControlFlow::Continue(());
        }

        if silent >= settings.connection_timeout {
            return ControlFlow::Break(PeerReason::TimedOut);
        }
        if self.peer.close_requested() && self.closing.is_none() {
            self.peer.set_state(PeerState::Disconnecting);
            self.closing = Some(Closing {
                started: now,
                close: None,
            });
        }

        let timing = self.timing(&settings);
        let mut frames = Vec::new();
        if let Err(err) = self.transmit(now, timing, &mut frames) {
            warn!(endpoint = %self.peer.endpoint(), %err, "connection failed");
            return ControlFlow::Break(PeerReason::TimedOut);
        }
        for inbound in self.inbound.iter_mut() {
            inbound.take_acks(&mut frames);
        }

        if let Some(closing) = self.closing.as_mut() {
            let flushed = self.peer.outbound().iter().all(|o| o.lock().is_idle());
            if !flushed {
                if now.saturating_duration_since(closing.started) >= settings.connection_timeout {
                    debug!(endpoint = %self.peer.endpoint(), "flush timed out, closing");
                    return ControlFlow::Break(PeerReason::Closed);
                }
            } else {
                match closing.close.as_mut() {
                    None => {
                        closing.close = Some(Retry::new(now));
                        frames.push(Frame::Close);
                    }
                    Some(retry) if retry.is_due(now, &timing) => {
                        if retry.attempts >= timing.fail_limit {
                            return ControlFlow::Break(PeerReason::Closed);
                        }
                        retry.record(now);
                        frames.push(Frame::Close);
                    }
                    Some(_) => {}
                }
            }
        }

        if frames.is_empty() && now.saturating_duration_since(self.last_sent) >= settings.idle_timeout {
            frames.push(Frame::Ping);
        }
        if !frames.is_empty() {
            self.send_frames(PacketKind::Data, frames, now, io);
        }
        ControlFlow::Continue(())
    }

    /// Pull due segments from every channel within the congestion window.
    fn transmit(&mut self, now: Instant, timing: RetransmitTiming, frames: &mut Vec<Frame>) -> Result<()> {
        let mut total = TransmitReport::default();
        for outbound in self.peer.outbound() {
            let mut outbound = outbound.lock();
            let mut ctx = TransmitContext {
                channel: outbound.channel(),
                now,
                timing,
                allowance: self.cubic.allowance(),
                frames: &mut *frames,
                report: TransmitReport::default(),
            };
            let result = outbound.transmit(&mut ctx);
            let report = ctx.report;
            let discarded = outbound.take_discarded();
            drop(outbound);

            self.cubic.on_packet_sent(report.window_bytes);
            if report.retransmitted_bytes > 0 {
                self.cubic.on_loss(report.retransmitted_bytes);
                self.cubic.on_packet_sent(report.retransmitted_bytes);
            }
            if report.abandoned_bytes + discarded > 0 {
                self.cubic.on_loss(report.abandoned_bytes + discarded);
            }
            total.retransmitted += report.retransmitted;
            total.fast_retransmitted += report.fast_retransmitted;
            total.retransmitted_bytes += report.retransmitted_bytes;
            result?;
        }
        if total.retransmitted > 0 {
            trace!(
                endpoint = %self.peer.endpoint(),
                segments = total.retransmitted,
                fast = total.fast_retransmitted,
                bytes = total.retransmitted_bytes,
                rto = ?timing.rto,
                "retransmitting"
            );
            self.peer
                .stats()
                .record_retransmissions(total.retransmitted, total.fast_retransmitted);
        }
        Ok(())
    }

    fn send_handshake(&mut self, now: Instant, io: &mut Io) {
        self.peer.stats().record_sent(self.handshake.len());
        io.outgoing.push((self.peer.endpoint(), self.handshake.clone()));
        self.last_sent = now;
    }

    /// Pack `frames` into as few packets as the MTU allows.
    fn send_frames(&mut self, kind: PacketKind, frames: Vec<Frame>, now: Instant, io: &mut Io) {
        let budget = frame_budget(self.mtu, self.secure.is_some());
        let mut batch = Vec::new();
        let mut used = 0;
        for frame in frames {
            let len = frame.encoded_len();
            if used + len > budget && !batch.is_empty() {
                self.send_batch(kind, std::mem::take(&mut batch), io);
                used = 0;
            }
            used += len;
            batch.push(frame);
        }
        if !batch.is_empty() {
            self.send_batch(kind, batch, io);
        }
        self.last_sent = now;
    }

    fn send_batch(&mut self, kind: PacketKind, frames: Vec<Frame>, io: &mut Io) {
        let session = self.session();
        let body = match self.secure.as_mut() {
            Some(secure) => match Body::seal(secure, kind, session, &frames) {
                Ok(body) => body,
                Err(err) => {
                    warn!(endpoint = %self.peer.endpoint(), %err, "failed to seal packet");
                    return;
                }
            },
            None => Body::Plain(frames),
        };
        io.send(&self.peer, &Packet::with_body(kind, session, body));
    }

    /// Reset the remote without waiting for an answer. Sealed on secure
    /// connections.
    pub fn abort(&mut self, io: &mut Io) {
        if self.is_established() {
            self.send_batch(PacketKind::Reset, Vec::new(), io);
        }
    }

    /// Release every resource and report the disconnection.
    pub fn finish(mut self, reason: PeerReason, io: &mut Io, announce: bool) {
        for inbound in self.inbound.iter_mut() {
            inbound.clear(&mut io.pool, &mut self.flow);
        }
        for outbound in self.peer.outbound() {
            outbound.lock().clear();
        }
        self.peer.disconnect(reason);
        debug!(endpoint = %self.peer.endpoint(), session = self.session(), %reason, "disconnected");
        if announce && self.announced {
            io.events.push(Event::Disconnection {
                peer: self.peer.clone(),
                reason,
            });
        }
    }
}

fn local_offer(settings: &Settings, mode: ConnectionMode, public_key: Option<Key>) -> Offer {
    Offer {
        mtu: settings.mtu,
        channels: settings.max_channels,
        window: u32::try_from(settings.downstream.window).unwrap_or(u32::MAX),
        loss: Offer::encode_loss(settings.downstream.loss),
        mode,
        public_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use terntrust::X25519;

    fn io(settings: Settings) -> Io {
        Io {
            settings: Arc::new(settings.validated()),
            agreement: Arc::new(X25519),
            identity: None,
            events: Arc::new(SegQueue::new()),
            pool: MemoryPool::new(),
            outgoing: Vec::new(),
        }
    }

    fn initiator_peer(mode: ConnectionMode) -> Peer {
        Peer::new("127.0.0.1:7000".parse().unwrap(), 42, mode)
    }

    /// Hand every queued datagram to `conn`, as if it came over the wire.
    fn deliver(from: &mut Io, conn: &mut Connection, to: &mut Io, now: Instant) -> Vec<ControlFlow<PeerReason>> {
        from.outgoing
            .drain(..)
            .map(|(_, bytes)| conn.on_packet(Packet::decode(&bytes).unwrap(), now, to))
            .collect()
    }

    fn handshake(mode: ConnectionMode) -> (Connection, Io, Connection, Io, Instant) {
        let now = Instant::now();
        let mut a_io = io(Settings::default());
        let mut b_io = io(Settings::default());
        let mut a = Connection::initiate(initiator_peer(mode), now, &mut a_io).unwrap();

        let (_, connect) = a_io.outgoing.pop().unwrap();
        let Packet::Connect { session, offer } = Packet::decode(&connect).unwrap() else {
            panic!("expected connect");
        };
        let mut b = Connection::accept("127.0.0.1:7001".parse().unwrap(), session, &offer, now, &mut b_io).unwrap();
        deliver(&mut b_io, &mut a, &mut a_io, now);
        assert!(a.is_established());
        deliver(&mut a_io, &mut b, &mut b_io, now);
        assert!(b.is_established());
        (a, a_io, b, b_io, now)
    }

    #[test]
    fn insecure_handshake_announces_both_sides() {
        let (a, a_io, b, b_io, _) = handshake(ConnectionMode::Insecure);
        assert_eq!(a.peer().state(), PeerState::Connected);
        assert_eq!(b.peer().state(), PeerState::Connected);
        assert!(matches!(a_io.events.pop(), Some(Event::Connection(_))));
        assert!(matches!(b_io.events.pop(), Some(Event::Connection(_))));
    }

    #[test]
    fn secure_handshake_carries_data() {
        let (mut a, mut a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Secure);
        b_io.events.pop();
        a.peer().send(Bytes::from_static(b"hello"), Delivery::Reliable).unwrap();

        assert!(a.update(now, &mut a_io).is_continue());
        deliver(&mut a_io, &mut b, &mut b_io, now);
        match b_io.events.pop() {
            Some(Event::Data { payload, delivery, .. }) => {
                assert_eq!(payload, Bytes::from_static(b"hello"));
                assert_eq!(delivery, Delivery::Reliable);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reset_while_connecting_is_refused() {
        let now = Instant::now();
        let mut a_io = io(Settings::default());
        let mut a = Connection::initiate(initiator_peer(ConnectionMode::Insecure), now, &mut a_io).unwrap();
        let flow = a.on_packet(Packet::reset(42), now, &mut a_io);
        assert_eq!(flow, ControlFlow::Break(PeerReason::Refused));
    }

    #[test]
    fn plain_reset_ends_insecure_connection() {
        let (a, _a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Insecure);
        let flow = b.on_packet(Packet::reset(a.session()), now, &mut b_io);
        assert_eq!(flow, ControlFlow::Break(PeerReason::Reset));
    }

    #[test]
    fn forged_reset_cannot_end_secure_connection() {
        let (mut a, mut a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Secure);

        // Anyone on the path can build this: the session travels in the clear.
        let flow = b.on_packet(Packet::reset(a.session()), now, &mut b_io);
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(b.peer().state(), PeerState::Connected);
        assert_eq!(b.peer().stats().dropped(), 1);

        let forged = Packet::Reset {
            session: a.session(),
            body: Body::Sealed {
                counter: 1000,
                ciphertext: Bytes::from(vec![0u8; terntrust::crypto::aead::TAG_LEN]),
            },
        };
        let flow = b.on_packet(Packet::decode(&forged.encode()).unwrap(), now, &mut b_io);
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(b.peer().stats().dropped(), 2);

        a.abort(&mut a_io);
        let (_, reset) = a_io.outgoing.pop().unwrap();
        let flow = b.on_packet(Packet::decode(&reset).unwrap(), now, &mut b_io);
        assert_eq!(flow, ControlFlow::Break(PeerReason::Reset));

        // Captured and sent again, the same Reset no longer opens.
        let flow = b.on_packet(Packet::decode(&reset).unwrap(), now, &mut b_io);
        assert_eq!(flow, ControlFlow::Continue(()));
    }

    #[test]
    fn mode_mismatch_is_an_error() {
        let now = Instant::now();
        let mut a_io = io(Settings::default());
        let mut a = Connection::initiate(initiator_peer(ConnectionMode::Insecure), now, &mut a_io).unwrap();
        let offer = local_offer(&a_io.settings, ConnectionMode::Secure, Some(Key::from_bytes([1; 32])));
        let flow = a.on_packet(Packet::Accept { session: 42, offer }, now, &mut a_io);
        assert_eq!(flow, ControlFlow::Break(PeerReason::Error));
    }

    #[test]
    fn unanswered_connect_becomes_unreachable() {
        let settings = Settings::default()
            .with_resend_timeout(Duration::from_millis(10))
            .with_ack_backoff(1.0)
            .with_ack_fail_limit(3);
        let now = Instant::now();
        let mut a_io = io(settings);
        let mut a = Connection::initiate(initiator_peer(ConnectionMode::Insecure), now, &mut a_io).unwrap();
        assert!(a.update(now + Duration::from_millis(10), &mut a_io).is_continue());
        assert!(a.update(now + Duration::from_millis(20), &mut a_io).is_continue());
        assert_eq!(a_io.outgoing.len(), 3);
        assert_eq!(
            a.update(now + Duration::from_millis(30), &mut a_io),
            ControlFlow::Break(PeerReason::Unreachable)
        );
    }

    #[test]
    fn remote_close_is_reported_as_reset() {
        let (mut a, mut a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Insecure);
        a.peer().close();
        assert!(a.update(now, &mut a_io).is_continue());
        assert_eq!(a.peer().state(), PeerState::Disconnecting);

        let flows = deliver(&mut a_io, &mut b, &mut b_io, now);
        assert_eq!(flows, vec![ControlFlow::Break(PeerReason::Reset)]);

        let flows = deliver(&mut b_io, &mut a, &mut a_io, now);
        assert_eq!(flows, vec![ControlFlow::Break(PeerReason::Closed)]);

        b.finish(PeerReason::Reset, &mut b_io, true);
        b_io.events.pop();
        assert!(matches!(
            b_io.events.pop(),
            Some(Event::Disconnection { reason: PeerReason::Reset, .. })
        ));
    }

    #[test]
    fn fragmented_message_crosses_a_secure_connection() {
        let (mut a, mut a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Secure);
        b_io.events.pop();
        let message = Bytes::from((0..5000u32).map(|i| i as u8).collect::<Vec<_>>());
        assert!(message.len() > a.peer().max_payload());
        a.peer().send(message.clone(), Delivery::Reliable).unwrap();

        assert!(a.update(now, &mut a_io).is_continue());
        assert!(a_io.outgoing.len() > 1, "one datagram per fragment");
        assert!(a_io
            .outgoing
            .iter()
            .all(|(_, bytes)| bytes.len() + crate::packet::IP_UDP_OVERHEAD <= usize::from(a.peer().mtu())));
        // Last fragment first.
        a_io.outgoing.reverse();
        deliver(&mut a_io, &mut b, &mut b_io, now);
        match b_io.events.pop() {
            Some(Event::Data { payload, .. }) => assert_eq!(payload, message),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(b_io.events.pop().is_none());
    }

    #[test]
    fn missing_segment_is_resent_before_its_timer() {
        let (mut a, mut a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Insecure);
        b_io.events.pop();
        for i in 0..5u8 {
            a.peer().send(vec![i], Delivery::Reliable).unwrap();
        }
        assert!(a.update(now, &mut a_io).is_continue());
        let (_, packet) = a_io.outgoing.pop().unwrap();
        let Packet::Data { session, body: Body::Plain(frames) } = Packet::decode(&packet).unwrap() else {
            panic!("expected a plain data packet");
        };
        assert_eq!(frames.len(), 5);

        // The segment at ordinal 1 is lost; the rest arrive.
        let survivors: Vec<Frame> = frames
            .into_iter()
            .filter(|f| !matches!(f, Frame::Segment { ordinal, .. } if *ordinal == Ordinal::new(1)))
            .collect();
        let flow = b.on_packet(Packet::Data { session, body: Body::Plain(survivors) }, now, &mut b_io);
        assert!(flow.is_continue());
        assert!(b.update(now, &mut b_io).is_continue());
        deliver(&mut b_io, &mut a, &mut a_io, now);

        let soon = now + std::time::Duration::from_millis(1);
        assert!(a.update(soon, &mut a_io).is_continue());
        assert_eq!(a.peer().stats().fast_retransmissions(), 1);
        assert_eq!(a.peer().stats().retransmissions(), 1);
        deliver(&mut a_io, &mut b, &mut b_io, soon);
        let delivered: Vec<u8> = std::iter::from_fn(|| b_io.events.pop())
            .filter_map(|e| match e {
                Event::Data { payload, .. } => Some(payload[0]),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn pinned_key_mismatch_aborts_the_handshake() {
        let now = Instant::now();
        let mut a_io = io(Settings::default());
        let mut b_io = io(Settings::default());
        let expected = X25519.create_public_key(&Key::from_bytes([3; 32]));
        let peer = Peer::with_pinned_key("127.0.0.1:7000".parse().unwrap(), 42, expected);
        let mut a = Connection::initiate(peer, now, &mut a_io).unwrap();
        let (_, connect) = a_io.outgoing.pop().unwrap();
        let Packet::Connect { session, offer } = Packet::decode(&connect).unwrap() else {
            panic!("expected connect");
        };
        let _b = Connection::accept("127.0.0.1:7001".parse().unwrap(), session, &offer, now, &mut b_io).unwrap();
        let flows = deliver(&mut b_io, &mut a, &mut a_io, now);
        assert_eq!(flows, vec![ControlFlow::Break(PeerReason::Error)]);
        assert!(!a.is_established());
    }

    #[test]
    fn pinned_key_accepts_the_matching_identity() {
        let now = Instant::now();
        let identity = Key::from_bytes([3; 32]);
        let mut a_io = io(Settings::default());
        let mut b_io = io(Settings::default());
        b_io.identity = Some(identity.clone());
        let expected = X25519.create_public_key(&identity);
        let peer = Peer::with_pinned_key("127.0.0.1:7000".parse().unwrap(), 42, expected);
        let mut a = Connection::initiate(peer, now, &mut a_io).unwrap();
        let (_, connect) = a_io.outgoing.pop().unwrap();
        let Packet::Connect { session, offer } = Packet::decode(&connect).unwrap() else {
            panic!("expected connect");
        };
        let mut b = Connection::accept("127.0.0.1:7001".parse().unwrap(), session, &offer, now, &mut b_io).unwrap();
        let flows = deliver(&mut b_io, &mut a, &mut a_io, now);
        assert_eq!(flows, vec![ControlFlow::Continue(())]);
        assert!(a.is_established());
        deliver(&mut a_io, &mut b, &mut b_io, now);
        assert!(b.is_established());
    }

    #[test]
    fn terminate_resets_the_remote_without_flushing() {
        let (mut a, mut a_io, mut b, mut b_io, now) = handshake(ConnectionMode::Secure);
        a.peer().send(Bytes::from_static(b"never sent"), Delivery::Reliable).unwrap();
        a.peer().terminate();
        assert_eq!(a.update(now, &mut a_io), ControlFlow::Break(PeerReason::Closed));
        assert_eq!(a_io.outgoing.len(), 1, "only the reset goes out");

        let flows = deliver(&mut a_io, &mut b, &mut b_io, now);
        assert_eq!(flows, vec![ControlFlow::Break(PeerReason::Reset)]);
    }
}
