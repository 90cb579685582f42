//! In-order reassembly for the acknowledged lanes.
//!
//! Segments that arrive ahead of the cursor are copied into pooled blocks and
//! parked in a reordering tree keyed by ordinal. When the gap in front of
//! them closes they are released to the application in one contiguous run.

use std::ops::ControlFlow;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::error::Result;
use crate::flow_control::FlowController;
use crate::memory::{BlockHandle, MemoryPool};
use crate::ordinal::Ordinal;
use crate::transport::Part;
use crate::tree::Tree;

/// Number of ordinals past `next` an acknowledgement can report.
pub const ACK_BITS: u16 = 32;

/// A segment held until the gap before it closes.
#[derive(Debug, Clone, Copy)]
struct Parked {
    handle: BlockHandle,
    part: Part,
}

/// Receive cursor plus reordering buffer for one lane.
#[derive(Debug)]
pub struct Sequencer {
    channel: u8,
    next: Ordinal,
    buffered: Tree<Parked>,
    ack_pending: bool,
}

impl Sequencer {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            next: Ordinal::default(),
            buffered: Tree::new(),
            ack_pending: false,
        }
    }

    /// The earliest ordinal not yet delivered.
    pub fn next(&self) -> Ordinal {
        self.next
    }

    /// Segments parked out of order.
    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Handle a segment; in-order data and whatever it unblocks are
    /// appended to `out`.
    pub fn accept(
        &mut self,
        ordinal: Ordinal,
        part: Part,
        payload: Bytes,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
        out: &mut Vec<(Part, Bytes)>,
    ) -> Result<()> {
        self.ack_pending = true;
        let distance = ordinal.distance(self.next);
        if distance < 0 {
            trace!(channel = self.channel, %ordinal, next = %self.next, "duplicate segment");
            return Ok(());
        }
        if distance == 0 {
            out.push((part, payload));
            self.next = self.next.next();
            return self.drain(pool, flow, out);
        }
        if self.buffered.contains(ordinal) {
            trace!(channel = self.channel, %ordinal, "segment already buffered");
            return Ok(());
        }
        if let Err(err) = flow.consume(self.channel, payload.len()) {
            trace!(channel = self.channel, %ordinal, %err, "dropping out-of-order segment");
            return Ok(());
        }
        let (_, parked) = self
            .buffered
            .try_add_or_get(ordinal, || Parked { handle: pool.get(), part });
        let handle = parked.handle;
        if let Err(err) = pool.copy_from(handle, &payload) {
            self.buffered.try_remove(ordinal);
            pool.return_block(handle)?;
            flow.release(self.channel, payload.len());
            return Err(err);
        }
        Ok(())
    }

    /// Advance the cursor to `base`, delivering whatever is buffered before
    /// it and abandoning the gaps. Earlier bases are ignored.
    pub fn skip_to(
        &mut self,
        base: Ordinal,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
        out: &mut Vec<(Part, Bytes)>,
    ) -> Result<()> {
        if !base.is_after(self.next) {
            return Ok(());
        }
        trace!(channel = self.channel, from = %self.next, to = %base, "skipping abandoned segments");
        self.release_before(base, pool, flow, out)?;
        self.next = base;
        self.drain(pool, flow, out)
    }

    /// Take the owed acknowledgement as `(next, bits)`, where bit `i`
    /// reports `next + 1 + i` as buffered.
    pub fn take_ack(&mut self) -> Option<(Ordinal, u32)> {
        if !std::mem::take(&mut self.ack_pending) {
            return None;
        }
        let mut bits = 0u32;
        if !self.buffered.is_empty() {
            for i in 0..ACK_BITS {
                if self.buffered.contains(self.next.wrapping_add(1 + i)) {
                    bits |= 1 << i;
                }
            }
        }
        Some((self.next, bits))
    }

    /// Return every buffered block to the pool. Returns how many blocks
    /// the pool no longer recognised.
    pub fn clear(&mut self, pool: &mut MemoryPool, flow: &mut FlowController) -> usize {
        let channel = self.channel;
        let mut lost = 0;
        self.buffered.remove_and_dispose_all(|ordinal, Parked { handle, .. }| {
            let returned = pool.len(handle).and_then(|len| {
                pool.return_block(handle)?;
                flow.release(channel, len);
                Ok(())
            });
            if let Err(err) = returned {
                warn!(channel, %ordinal, %err, "buffered block not returned to pool");
                lost += 1;
            }
        });
        self.ack_pending = false;
        lost
    }

    fn drain(
        &mut self,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
        out: &mut Vec<(Part, Bytes)>,
    ) -> Result<()> {
        let mut cursor = self.next;
        self.buffered.traverse(|key, _| {
            if key != cursor {
                return ControlFlow::Break(());
            }
            cursor = cursor.next();
            ControlFlow::Continue(())
        });
        if cursor == self.next {
            return Ok(());
        }
        self.release_before(cursor, pool, flow, out)?;
        self.next = cursor;
        Ok(())
    }

    fn release_before(
        &mut self,
        cutoff: Ordinal,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
        out: &mut Vec<(Part, Bytes)>,
    ) -> Result<()> {
        let channel = self.channel;
        let mut failure = None;
        self.buffered.remove_and_dispose_before(cutoff, |_, Parked { handle, part }| {
            let released = pool.to_bytes(handle).and_then(|bytes| {
                flow.release(channel, bytes.len());
                pool.return_block(handle)?;
                Ok(bytes)
            });
            match released {
                Ok(bytes) => out.push((part, bytes)),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
