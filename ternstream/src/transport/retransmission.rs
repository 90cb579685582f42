//! Ordered queue of outbound segments awaiting (re)transmission.
//!
//! Segments stay in ordinal order from `send` until acknowledged. A segment
//! is first transmitted when the congestion allowance admits it, then again
//! each time its timer fires: `rto * backoff^(n-1)` after its n-th
//! transmission. Once a segment has been sent `fail_limit` times without an
//! acknowledgement it is reported as exhausted; the lane decides whether
//! that drops the segment or the connection.
//!
//! An acknowledgement that reports at least [`FAST_RETRANSMIT_THRESHOLD`]
//! segments held past the cumulative point marks the segment at that point
//! for one early retransmission.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::frame::Frame;
use crate::ordinal::{Ordinal, WINDOW_SIZE};
use crate::transport::{
    AckOutcome, Backlog, Delivery, Part, TransmitContext, FAST_RETRANSMIT_THRESHOLD,
};

/// Outbound lane capacity in segments. One ordinal is kept free so the
/// oldest unacknowledged segment is never a full window behind `next`.
pub const MAX_OUTSTANDING: usize = WINDOW_SIZE as usize - 1;

/// Early retransmission state of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FastRetransmit {
    #[default]
    Idle,
    /// Reported missing; goes out on the next poll.
    Due,
    /// Already sent early once.
    Done,
}

/// A queued outbound segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub ordinal: Ordinal,
    pub part: Part,
    pub payload: Bytes,
    pub first_sent: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub transmissions: u32,
    pub fast: FastRetransmit,
}

/// What a poll did with segments that ran out of transmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Nothing ran out.
    None,
    /// At least one segment reached its limit and was left in place.
    Kept,
    /// This many payload bytes were discarded.
    Dropped(usize),
}

/// Retransmission queue for one acknowledged lane.
#[derive(Debug)]
pub struct RetransmitQueue {
    next: Ordinal,
    segments: VecDeque<Segment>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        Self {
            next: Ordinal::default(),
            segments: VecDeque::new(),
        }
    }

    /// Ordinal the next queued segment will take.
    pub fn next_ordinal(&self) -> Ordinal {
        self.next
    }

    /// Oldest ordinal still retained, or `next` if the queue is empty.
    pub fn base(&self) -> Ordinal {
        self.segments.front().map_or(self.next, |s| s.ordinal)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_full(&self) -> bool {
        !self.has_room(1)
    }

    /// Whether `count` more segments fit.
    pub fn has_room(&self, count: usize) -> bool {
        self.segments.len() + count <= MAX_OUTSTANDING
    }

    /// Segments sent at least once and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.last_sent.is_some())
            .count()
    }

    pub fn push(&mut self, payload: Bytes) -> Ordinal {
        self.push_part(payload, Part::Whole)
    }

    pub fn push_part(&mut self, payload: Bytes, part: Part) -> Ordinal {
        let ordinal = self.next;
        self.next = self.next.next();
        self.segments.push_back(Segment {
            ordinal,
            part,
            payload,
            first_sent: None,
            last_sent: None,
            transmissions: 0,
            fast: FastRetransmit::Idle,
        });
        ordinal
    }

    /// Discard the oldest segment if it has already been transmitted.
    /// Returns its payload size.
    pub fn pop_stale(&mut self) -> Option<usize> {
        match self.segments.front() {
            Some(s) if s.last_sent.is_some() => {
                self.segments.pop_front().map(|s| s.payload.len())
            }
            _ => None,
        }
    }

    /// Remove every transmitted segment the ack covers: all before `next`,
    /// plus `next + 1 + i` for each set bit `i`. Enough set bits mark the
    /// segment at `next` for fast retransmission.
    pub fn on_ack(
        &mut self,
        next: Ordinal,
        bits: u32,
        now: Instant,
        backlog: &mut Backlog,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let mut newest_sample = None;
        self.segments.retain(|s| {
            if s.last_sent.is_none() {
                return true;
            }
            let covered = s.ordinal.is_before(next) || {
                let offset = s.ordinal.distance(next);
                (1..=32).contains(&offset) && bits & (1 << (offset - 1)) != 0
            };
            if !covered {
                return true;
            }
            outcome.acked += 1;
            outcome.acked_bytes += s.payload.len();
            backlog.release(s.payload.len());
            // Karn: ambiguous samples from retransmitted segments are skipped.
            if s.transmissions == 1 {
                if let Some(sent) = s.first_sent {
                    newest_sample = Some(now.saturating_duration_since(sent));
                }
            }
            false
        });
        outcome.rtt_sample = newest_sample;

        if bits.count_ones() >= FAST_RETRANSMIT_THRESHOLD {
            if let Some(front) = self.segments.front_mut() {
                if front.ordinal == next
                    && front.last_sent.is_some()
                    && front.fast == FastRetransmit::Idle
                {
                    front.fast = FastRetransmit::Due;
                }
            }
        }
        outcome
    }

    /// Emit due segments into `ctx.frames`.
    ///
    /// Retransmissions are not limited by the congestion allowance; first
    /// transmissions stop at the first segment the allowance cannot cover.
    /// With `drop_exhausted`, segments out of transmissions are discarded.
    pub fn poll(
        &mut self,
        delivery: Delivery,
        ctx: &mut TransmitContext<'_>,
        backlog: &mut Backlog,
        drop_exhausted: bool,
    ) -> Exhausted {
        let mut exhausted = Exhausted::None;
        let mut dropped = 0usize;

        if drop_exhausted {
            let limit = ctx.timing.fail_limit;
            let now = ctx.now;
            let timing = ctx.timing;
            self.segments.retain(|s| match s.last_sent {
                Some(last)
                    if s.transmissions >= limit
                        && now.saturating_duration_since(last) >= timing.delay(s.transmissions) =>
                {
                    dropped += s.payload.len();
                    backlog.release(s.payload.len());
                    false
                }
                _ => true,
            });
        }

        let base = self.base();
        let mut admit_new = true;
        for s in self.segments.iter_mut() {
            match s.last_sent {
                None => {
                    let size = s.payload.len();
                    if !admit_new || size > ctx.allowance {
                        admit_new = false;
                        continue;
                    }
                    ctx.allowance -= size;
                    ctx.report.new_bytes += size;
                    ctx.report.window_bytes += size;
                    s.first_sent = Some(ctx.now);
                    s.last_sent = Some(ctx.now);
                    s.transmissions = 1;
                }
                Some(last) => {
                    let fired =
                        ctx.now.saturating_duration_since(last) >= ctx.timing.delay(s.transmissions);
                    let fast = s.fast == FastRetransmit::Due;
                    if !fired && !fast {
                        continue;
                    }
                    if fast {
                        s.fast = FastRetransmit::Done;
                    }
                    if s.transmissions >= ctx.timing.fail_limit {
                        if fired {
                            exhausted = Exhausted::Kept;
                        }
                        continue;
                    }
                    if fast {
                        ctx.report.fast_retransmitted += 1;
                    }
                    ctx.report.retransmitted += 1;
                    ctx.report.retransmitted_bytes += s.payload.len();
                    s.last_sent = Some(ctx.now);
                    s.transmissions += 1;
                }
            }
            ctx.frames.push(Frame::Segment {
                channel: ctx.channel,
                delivery,
                ordinal: s.ordinal,
                base,
                part: s.part,
                payload: s.payload.clone(),
            });
        }

        if dropped > 0 {
            ctx.report.abandoned_bytes += dropped;
            return Exhausted::Dropped(dropped);
        }
        exhausted
    }

    /// Empty the queue, returning the bytes to the backlog.
    pub fn clear(&mut self, backlog: &mut Backlog) {
        for s in self.segments.drain(..) {
            backlog.release(s.payload.len());
        }
    }
}

impl Default for RetransmitQueue {
    fn default() -> Self {
        Self::new()
    }
}
