//! Ordered lane that gives up on stale data.
//!
//! Like the reliable lane, segments are retransmitted until acknowledged and
//! delivered in order. Unlike it, the sender may abandon a segment: when it
//! runs out of transmissions, or when new data needs room in a full backlog
//! and the oldest segment has already been sent. Every segment carries the
//! sender's oldest retained ordinal so the receiver can step past the holes.

use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, TernStreamError};
use crate::flow_control::FlowController;
use crate::memory::MemoryPool;
use crate::ordinal::Ordinal;
use crate::transport::retransmission::{Exhausted, RetransmitQueue};
use crate::transport::sequencer::Sequencer;
use crate::transport::{
    AckOutcome, Backlog, Delivery, Part, TransmitContext, TransportReceiver, TransportSender,
};

#[derive(Debug, Default)]
pub struct SemireliableSender {
    queue: RetransmitQueue,
}

impl SemireliableSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest ordinal the receiver may still see.
    pub fn base(&self) -> Ordinal {
        self.queue.base()
    }

    fn make_room(&mut self, size: usize, backlog: &mut Backlog) {
        while !backlog.fits(size) || self.queue.is_full() {
            let Some(stale) = self.queue.pop_stale() else {
                break;
            };
            backlog.release(stale);
            backlog.discard_in_flight(stale);
            debug!(channel = backlog.channel(), bytes = stale, "discarded stale segment");
        }
    }
}

impl TransportSender for SemireliableSender {
    fn delivery(&self) -> Delivery {
        Delivery::Semireliable
    }

    fn send(&mut self, payload: Bytes, backlog: &mut Backlog) -> Result<Ordinal> {
        self.make_room(payload.len(), backlog);
        if self.queue.is_full() {
            return Err(TernStreamError::BacklogFull {
                channel: backlog.channel(),
                pending: backlog.pending(),
                size: payload.len(),
                capacity: backlog.capacity(),
            });
        }
        backlog.reserve(payload.len())?;
        Ok(self.queue.push(payload))
    }

    fn on_ack(
        &mut self,
        next: Ordinal,
        bits: u32,
        now: Instant,
        backlog: &mut Backlog,
    ) -> AckOutcome {
        self.queue.on_ack(next, bits, now, backlog)
    }

    fn transmit(&mut self, ctx: &mut TransmitContext<'_>, backlog: &mut Backlog) -> Result<()> {
        if let Exhausted::Dropped(bytes) =
            self.queue.poll(Delivery::Semireliable, ctx, backlog, true)
        {
            debug!(channel = ctx.channel, bytes, "abandoned unacknowledged segments");
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&mut self, backlog: &mut Backlog) {
        self.queue.clear(backlog);
    }
}

#[derive(Debug)]
pub struct SemireliableReceiver {
    sequencer: Sequencer,
}

impl SemireliableReceiver {
    pub fn new(channel: u8) -> Self {
        Self {
            sequencer: Sequencer::new(channel),
        }
    }
}

impl TransportReceiver for SemireliableReceiver {
    fn delivery(&self) -> Delivery {
        Delivery::Semireliable
    }

    fn receive(
        &mut self,
        ordinal: Ordinal,
        base: Ordinal,
        _: Part,
        payload: Bytes,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
    ) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        self.sequencer.skip_to(base, pool, flow, &mut out)?;
        self.sequencer.accept(ordinal, Part::Whole, payload, pool, flow, &mut out)?;
        Ok(out.into_iter().map(|(_, payload)| payload).collect())
    }

    fn take_ack(&mut self) -> Option<(Ordinal, u32)> {
        self.sequencer.take_ack()
    }

    fn clear(&mut self, pool: &mut MemoryPool, flow: &mut FlowController) {
        self.sequencer.clear(pool, flow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::transport::RetransmitTiming;
    use std::time::Duration;

    fn transmit(sender: &mut SemireliableSender, backlog: &mut Backlog, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut ctx = TransmitContext {
            channel: 0,
            now,
            timing: RetransmitTiming {
                rto: Duration::from_millis(50),
                backoff: 1.0,
                fail_limit: 2,
            },
            allowance: usize::MAX,
            frames: &mut frames,
            report: Default::default(),
        };
        sender.transmit(&mut ctx, backlog).unwrap();
        frames
    }

    #[test]
    fn full_backlog_discards_transmitted_front() {
        let mut sender = SemireliableSender::new();
        let mut backlog = Backlog::new(0, 8);
        sender.send(Bytes::from_static(b"aaaa"), &mut backlog).unwrap();
        sender.send(Bytes::from_static(b"bbbb"), &mut backlog).unwrap();

        // Nothing transmitted yet, so nothing can be discarded.
        assert!(sender.send(Bytes::from_static(b"cccc"), &mut backlog).is_err());

        transmit(&mut sender, &mut backlog, Instant::now());
        let ordinal = sender.send(Bytes::from_static(b"cccc"), &mut backlog).unwrap();
        assert_eq!(ordinal, Ordinal::new(2));
        assert_eq!(sender.base(), Ordinal::new(1));
        assert_eq!(backlog.take_discarded(), 4);
    }

    #[test]
    fn exhausted_segments_are_abandoned() {
        let mut sender = SemireliableSender::new();
        let mut backlog = Backlog::new(0, 64);
        sender.send(Bytes::from_static(b"x"), &mut backlog).unwrap();
        let t0 = Instant::now();
        assert_eq!(transmit(&mut sender, &mut backlog, t0).len(), 1);
        assert_eq!(transmit(&mut sender, &mut backlog, t0 + Duration::from_millis(50)).len(), 1);
        assert!(transmit(&mut sender, &mut backlog, t0 + Duration::from_millis(100)).is_empty());
        assert!(sender.is_idle());
        assert_eq!(sender.base(), Ordinal::new(1));
    }

    #[test]
    fn receiver_skips_to_sender_base() {
        let mut receiver = SemireliableReceiver::new(0);
        let mut pool = MemoryPool::new();
        let mut flow = FlowController::new(1024);

        let out = receiver
            .receive(Ordinal::new(2), Ordinal::new(0), Part::Whole, Bytes::from_static(b"c"), &mut pool, &mut flow)
            .unwrap();
        assert!(out.is_empty());

        // The sender gave up on 0 and 1.
        let out = receiver
            .receive(Ordinal::new(3), Ordinal::new(2), Part::Whole, Bytes::from_static(b"d"), &mut pool, &mut flow)
            .unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"c"), Bytes::from_static(b"d")]);
        assert_eq!(receiver.take_ack(), Some((Ordinal::new(4), 0)));
    }
}
