//! Fire-and-forget lane.
//!
//! Segments are sent once, in submission order, on the next transmit pass
//! and bypass the congestion window. A segment queued with a deadline is
//! dropped instead if the deadline passes first. The receiver hands every
//! segment to the application as it arrives and never acknowledges.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::trace;

use crate::error::Result;
use crate::flow_control::FlowController;
use crate::frame::Frame;
use crate::memory::MemoryPool;
use crate::ordinal::Ordinal;
use crate::transport::{
    AckOutcome, Backlog, Delivery, Part, TransmitContext, TransportReceiver, TransportSender,
};

#[derive(Debug)]
struct Queued {
    ordinal: Ordinal,
    payload: Bytes,
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct UnreliableSender {
    next: Ordinal,
    queue: VecDeque<Queued>,
}

impl UnreliableSender {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(
        &mut self,
        payload: Bytes,
        expires: Option<Instant>,
        backlog: &mut Backlog,
    ) -> Result<Ordinal> {
        backlog.reserve(payload.len())?;
        let ordinal = self.next;
        self.next = self.next.next();
        self.queue.push_back(Queued {
            ordinal,
            payload,
            expires,
        });
        Ok(ordinal)
    }
}

impl TransportSender for UnreliableSender {
    fn delivery(&self) -> Delivery {
        Delivery::Unreliable
    }

    fn send(&mut self, payload: Bytes, backlog: &mut Backlog) -> Result<Ordinal> {
        self.enqueue(payload, None, backlog)
    }

    fn send_expiring(
        &mut self,
        payload: Bytes,
        expires: Instant,
        backlog: &mut Backlog,
    ) -> Result<Ordinal> {
        self.enqueue(payload, Some(expires), backlog)
    }

    fn on_ack(&mut self, _: Ordinal, _: u32, _: Instant, _: &mut Backlog) -> AckOutcome {
        AckOutcome::default()
    }

    fn transmit(&mut self, ctx: &mut TransmitContext<'_>, backlog: &mut Backlog) -> Result<()> {
        for Queued {
            ordinal,
            payload,
            expires,
        } in self.queue.drain(..)
        {
            backlog.release(payload.len());
            if expires.is_some_and(|deadline| ctx.now >= deadline) {
                trace!(channel = ctx.channel, %ordinal, bytes = payload.len(), "segment expired unsent");
                ctx.report.expired += 1;
                continue;
            }
            ctx.report.new_bytes += payload.len();
            ctx.frames.push(Frame::Segment {
                channel: ctx.channel,
                delivery: Delivery::Unreliable,
                ordinal,
                base: ordinal,
                part: Part::Whole,
                payload,
            });
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&mut self, backlog: &mut Backlog) {
        for queued in self.queue.drain(..) {
            backlog.release(queued.payload.len());
        }
    }
}

#[derive(Debug, Default)]
pub struct UnreliableReceiver;

impl UnreliableReceiver {
    pub fn new() -> Self {
        Self
    }
}

impl TransportReceiver for UnreliableReceiver {
    fn delivery(&self) -> Delivery {
        Delivery::Unreliable
    }

    fn receive(
        &mut self,
        _: Ordinal,
        _: Ordinal,
        _: Part,
        payload: Bytes,
        _: &mut MemoryPool,
        _: &mut FlowController,
    ) -> Result<Vec<Bytes>> {
        Ok(vec![payload])
    }

    fn take_ack(&mut self) -> Option<(Ordinal, u32)> {
        None
    }

    fn clear(&mut self, _: &mut MemoryPool, _: &mut FlowController) {}
}
