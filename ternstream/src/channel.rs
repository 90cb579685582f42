//! Channels: one outbound and one inbound half per channel index.
//!
//! Each half owns three lanes, one per [`Delivery`] mode, created up front
//! so the mode can be chosen per message. The outbound half is shared with
//! the application behind a lock; the inbound half belongs to the I/O thread.

use std::time::Instant;

use bytes::Bytes;

use crate::error::Result;
use crate::flow_control::FlowController;
use crate::frame::Frame;
use crate::memory::MemoryPool;
use crate::ordinal::Ordinal;
use crate::transport::reliable::{ReliableReceiver, ReliableSender};
use crate::transport::semireliable::{SemireliableReceiver, SemireliableSender};
use crate::transport::unreliable::{UnreliableReceiver, UnreliableSender};
use crate::transport::{
    AckOutcome, Backlog, Delivery, Part, TransmitContext, TransportReceiver, TransportSender,
};

/// Sending half of a channel.
pub struct Outbound {
    backlog: Backlog,
    lanes: [Box<dyn TransportSender>; 3],
}

impl Outbound {
    /// Create the lanes for `channel` sharing a backlog of `capacity` bytes.
    /// Reliable messages above `max_segment` bytes go out as fragments of
    /// `max_fragment` bytes.
    pub fn new(channel: u8, capacity: usize, max_segment: usize, max_fragment: usize) -> Self {
        Self {
            backlog: Backlog::new(channel, capacity),
            lanes: [
                Box::new(UnreliableSender::new()),
                Box::new(SemireliableSender::new()),
                Box::new(ReliableSender::new(max_segment, max_fragment)),
            ],
        }
    }

    pub fn channel(&self) -> u8 {
        self.backlog.channel()
    }

    /// Bytes queued or awaiting acknowledgement across all lanes.
    pub fn pending(&self) -> usize {
        self.backlog.pending()
    }

    pub fn send(&mut self, delivery: Delivery, payload: Bytes) -> Result<Ordinal> {
        self.lanes[delivery.index()].send(payload, &mut self.backlog)
    }

    /// Queue an unreliable payload that is dropped unsent after `expires`.
    pub fn send_volatile(&mut self, payload: Bytes, expires: Instant) -> Result<Ordinal> {
        self.lanes[Delivery::Unreliable.index()].send_expiring(payload, expires, &mut self.backlog)
    }

    pub fn on_ack(&mut self, delivery: Delivery, next: Ordinal, bits: u32, now: Instant) -> AckOutcome {
        self.lanes[delivery.index()].on_ack(next, bits, now, &mut self.backlog)
    }

    /// Collect due frames from every lane, most reliable first.
    pub fn transmit(&mut self, ctx: &mut TransmitContext<'_>) -> Result<()> {
        for lane in self.lanes.iter_mut().rev() {
            lane.transmit(ctx, &mut self.backlog)?;
        }
        Ok(())
    }

    /// Bytes dropped by the sender while in flight since the last call.
    pub fn take_discarded(&mut self) -> usize {
        self.backlog.take_discarded()
    }

    pub fn is_idle(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_idle())
    }

    pub fn clear(&mut self) {
        for lane in self.lanes.iter_mut() {
            lane.clear(&mut self.backlog);
        }
    }
}

/// Receiving half of a channel.
pub struct Inbound {
    channel: u8,
    lanes: [Box<dyn TransportReceiver>; 3],
}

impl Inbound {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            lanes: [
                Box::new(UnreliableReceiver::new()),
                Box::new(SemireliableReceiver::new(channel)),
                Box::new(ReliableReceiver::new(channel)),
            ],
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn receive(
        &mut self,
        delivery: Delivery,
        ordinal: Ordinal,
        base: Ordinal,
        part: Part,
        payload: Bytes,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
    ) -> Result<Vec<Bytes>> {
        self.lanes[delivery.index()].receive(ordinal, base, part, payload, pool, flow)
    }

    /// Append an ACK frame for every lane that owes one.
    pub fn take_acks(&mut self, frames: &mut Vec<Frame>) {
        for lane in self.lanes.iter_mut() {
            if let Some((next, bits)) = lane.take_ack() {
                frames.push(Frame::Ack {
                    channel: self.channel,
                    delivery: lane.delivery(),
                    next,
                    bits,
                });
            }
        }
    }

    pub fn clear(&mut self, pool: &mut MemoryPool, flow: &mut FlowController) {
        for lane in self.lanes.iter_mut() {
            lane.clear(pool, flow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RetransmitTiming;
    use std::time::Duration;

    fn outbound(channel: u8, capacity: usize) -> Outbound {
        Outbound::new(channel, capacity, 16, 14)
    }

    fn transmit(outbound: &mut Outbound, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut ctx = TransmitContext {
            channel: outbound.channel(),
            now,
            timing: RetransmitTiming {
                rto: Duration::from_millis(100),
                backoff: 1.5,
                fail_limit: 5,
            },
            allowance: usize::MAX,
            frames: &mut frames,
            report: Default::default(),
        };
        outbound.transmit(&mut ctx).unwrap();
        frames
    }

    #[test]
    fn lanes_have_independent_ordinals() {
        let mut outbound = outbound(0, 1024);
        for delivery in Delivery::ALL {
            assert_eq!(outbound.send(delivery, Bytes::from_static(b"a")).unwrap(), Ordinal::new(0));
        }
        assert_eq!(
            outbound.send(Delivery::Reliable, Bytes::from_static(b"b")).unwrap(),
            Ordinal::new(1)
        );
        assert_eq!(outbound.pending(), 4);
        assert_eq!(transmit(&mut outbound, Instant::now()).len(), 4);
    }

    #[test]
    fn lanes_share_one_backlog() {
        let mut outbound = outbound(0, 4);
        outbound.send(Delivery::Unreliable, Bytes::from_static(b"abc")).unwrap();
        let err = outbound
            .send(Delivery::Reliable, Bytes::from_static(b"de"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }

    #[test]
    fn volatile_payload_expires_on_the_unreliable_lane() {
        let mut outbound = outbound(0, 64);
        let now = Instant::now();
        outbound.send_volatile(Bytes::from_static(b"late"), now).unwrap();
        outbound
            .send_volatile(Bytes::from_static(b"soon"), now + Duration::from_secs(1))
            .unwrap();
        let frames = transmit(&mut outbound, now);
        assert!(matches!(
            &frames[..],
            [Frame::Segment { delivery: Delivery::Unreliable, payload, .. }] if payload == "soon"
        ));
        assert_eq!(outbound.pending(), 0);
    }

    #[test]
    fn segments_flow_end_to_end() {
        let mut outbound = outbound(3, 1024);
        let mut inbound = Inbound::new(3);
        let mut pool = MemoryPool::new();
        let mut flow = FlowController::new(1024);

        let long = "a message longer than one segment";
        for text in ["one", long, "three"] {
            outbound.send(Delivery::Reliable, Bytes::from(text)).unwrap();
        }
        let now = Instant::now();
        let mut frames = transmit(&mut outbound, now);
        frames.reverse();

        let mut delivered = Vec::new();
        for frame in frames {
            let Frame::Segment { channel, delivery, ordinal, base, part, payload } = frame else {
                panic!("expected segment");
            };
            assert_eq!(channel, 3);
            delivered.extend(
                inbound
                    .receive(delivery, ordinal, base, part, payload, &mut pool, &mut flow)
                    .unwrap(),
            );
        }
        assert_eq!(delivered, vec!["one", long, "three"]);

        let mut acks = Vec::new();
        inbound.take_acks(&mut acks);
        assert_eq!(acks.len(), 1);
        let Frame::Ack { delivery, next, bits, .. } = acks[0] else {
            panic!("expected ack");
        };
        let outcome = outbound.on_ack(delivery, next, bits, now);
        assert_eq!(outcome.acked, 5, "the long message took three segments");
        assert!(outbound.is_idle());
        assert_eq!(outbound.pending(), 0);
    }
}
