//! Exactly-once, in-order lane.
//!
//! A segment stays queued until acknowledged. If it reaches the transmission
//! limit without an acknowledgement the lane fails and the connection with it.
//!
//! Messages too large for one segment are split into up to
//! [`MAX_FRAGMENTS`] fragments on consecutive ordinals and joined again by
//! the receiver before delivery.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::error::{Result, TernStreamError};
use crate::flow_control::FlowController;
use crate::memory::MemoryPool;
use crate::ordinal::Ordinal;
use crate::transport::retransmission::{Exhausted, RetransmitQueue};
use crate::transport::sequencer::Sequencer;
use crate::transport::{
    AckOutcome, Backlog, Delivery, Part, TransmitContext, TransportReceiver, TransportSender,
    MAX_FRAGMENTS,
};

#[derive(Debug)]
pub struct ReliableSender {
    queue: RetransmitQueue,
    max_segment: usize,
    max_fragment: usize,
}

impl ReliableSender {
    /// A lane that sends payloads of up to `max_segment` bytes whole and
    /// splits larger ones into fragments of up to `max_fragment` bytes.
    pub fn new(max_segment: usize, max_fragment: usize) -> Self {
        Self {
            queue: RetransmitQueue::new(),
            max_segment,
            max_fragment: max_fragment.max(1),
        }
    }

    /// Largest message `send` accepts.
    pub fn max_message(&self) -> usize {
        self.max_segment.max(self.max_fragment * MAX_FRAGMENTS)
    }

    /// Segments awaiting acknowledgement or first transmission.
    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }
}

impl TransportSender for ReliableSender {
    fn delivery(&self) -> Delivery {
        Delivery::Reliable
    }

    fn send(&mut self, payload: Bytes, backlog: &mut Backlog) -> Result<Ordinal> {
        let size = payload.len();
        let parts = if size <= self.max_segment {
            1
        } else {
            size.div_ceil(self.max_fragment)
        };
        if parts > MAX_FRAGMENTS {
            return Err(TernStreamError::PayloadTooLarge {
                size,
                max: self.max_message(),
            });
        }
        if !self.queue.has_room(parts) {
            return Err(TernStreamError::BacklogFull {
                channel: backlog.channel(),
                pending: backlog.pending(),
                size,
                capacity: backlog.capacity(),
            });
        }
        backlog.reserve(size)?;
        if parts == 1 {
            return Ok(self.queue.push(payload));
        }

        let first = self.queue.next_ordinal();
        let last = (parts - 1) as u8;
        for (index, start) in (0..size).step_by(self.max_fragment).enumerate() {
            let end = (start + self.max_fragment).min(size);
            let part = Part::Fragment {
                index: index as u8,
                last,
            };
            self.queue.push_part(payload.slice(start..end), part);
        }
        Ok(first)
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
        match self.queue.poll(Delivery::Reliable, ctx, backlog, false) {
            Exhausted::Kept => {
                warn!(
                    channel = ctx.channel,
                    base = %self.queue.base(),
                    limit = ctx.timing.fail_limit,
                    "reliable segment exhausted its transmissions"
                );
                Err(TernStreamError::ConnectionTimeout)
            }
            _ => Ok(()),
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&mut self, backlog: &mut Backlog) {
        self.queue.clear(backlog);
    }
}

/// A fragmented message being joined.
#[derive(Debug)]
struct Reassembly {
    next: u8,
    last: u8,
    message: BytesMut,
}

#[derive(Debug)]
pub struct ReliableReceiver {
    channel: u8,
    sequencer: Sequencer,
    partial: Option<Reassembly>,
}

impl ReliableReceiver {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            sequencer: Sequencer::new(channel),
            partial: None,
        }
    }

    /// Bytes held for a message whose fragments have not all arrived.
    pub fn reassembling(&self) -> usize {
        self.partial.as_ref().map_or(0, |p| p.message.len())
    }

    /// Feed one in-order segment, appending to `out` once a message is
    /// complete. A fragment out of sequence drops the message it belongs to.
    fn assemble(&mut self, part: Part, payload: Bytes, out: &mut Vec<Bytes>) {
        let (index, last) = match part {
            Part::Whole => {
                if let Some(partial) = self.partial.take() {
                    warn!(channel = self.channel, bytes = partial.message.len(), "incomplete message dropped");
                }
                out.push(payload);
                return;
            }
            Part::Fragment { index, last } => (index, last),
        };
        let mut partial = match (self.partial.take(), index) {
            (Some(p), _) if p.next == index && p.last == last => p,
            (stale, 0) => {
                if let Some(stale) = stale {
                    warn!(channel = self.channel, bytes = stale.message.len(), "incomplete message dropped");
                }
                Reassembly {
                    next: 0,
                    last,
                    message: BytesMut::new(),
                }
            }
            (stale, _) => {
                warn!(
                    channel = self.channel,
                    index,
                    last,
                    dropped = stale.map_or(0, |p| p.message.len()),
                    "fragment out of sequence"
                );
                return;
            }
        };
        partial.message.extend_from_slice(&payload);
        if index == last {
            out.push(partial.message.freeze());
        } else {
            partial.next = index + 1;
            self.partial = Some(partial);
        }
    }
}

impl TransportReceiver for ReliableReceiver {
    fn delivery(&self) -> Delivery {
        Delivery::Reliable
    }

    fn receive(
        &mut self,
        ordinal: Ordinal,
        _: Ordinal,
        part: Part,
        payload: Bytes,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
    ) -> Result<Vec<Bytes>> {
        let mut ready = Vec::new();
        self.sequencer.accept(ordinal, part, payload, pool, flow, &mut ready)?;
        let mut out = Vec::new();
        for (part, payload) in ready {
            self.assemble(part, payload, &mut out);
        }
        Ok(out)
    }

    fn take_ack(&mut self) -> Option<(Ordinal, u32)> {
        self.sequencer.take_ack()
    }

    fn clear(&mut self, pool: &mut MemoryPool, flow: &mut FlowController) {
        self.sequencer.clear(pool, flow);
        self.partial = None;
    }
}
