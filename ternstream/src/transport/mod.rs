//! Delivery modes and the per-lane sender/receiver traits.
//!
//! Every channel carries three independent lanes, one per [`Delivery`]
//! mode, each with its own ordinal space. Senders live behind the channel's
//! outbound lock and are driven both by the application (`send`) and the I/O
//! worker (`transmit`, `on_ack`); receivers belong to the worker alone.

pub mod reliable;
pub mod retransmission;
pub mod semireliable;
pub mod sequencer;
pub mod unreliable;

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{Result, TernStreamError};
use crate::flow_control::FlowController;
use crate::frame::Frame;
use crate::memory::MemoryPool;
use crate::ordinal::Ordinal;

/// The three delivery modes, in increasing order of guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Delivery {
    /// Sent once; loss, duplication and reordering reach the application.
    Unreliable = 0x00,
    /// Retransmitted until acknowledged or superseded; delivered in order,
    /// but the receiver skips data the sender has given up on.
    Semireliable = 0x01,
    /// Retransmitted until acknowledged; delivered in order, exactly once.
    Reliable = 0x02,
}

impl Delivery {
    pub const ALL: [Delivery; 3] = [
        Delivery::Unreliable,
        Delivery::Semireliable,
        Delivery::Reliable,
    ];

    /// Convert from a raw u8.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(Delivery::Unreliable),
            0x01 => Ok(Delivery::Semireliable),
            0x02 => Ok(Delivery::Reliable),
            other => Err(TernStreamError::InvalidDelivery(other)),
        }
    }

    /// Lane index within a channel.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether receivers acknowledge this mode.
    pub fn is_acknowledged(self) -> bool {
        !matches!(self, Delivery::Unreliable)
    }
}

/// Most fragments one reliable message can be split into.
pub const MAX_FRAGMENTS: usize = 256;

/// Segments acknowledged past a gap before the segment in the gap is
/// retransmitted without waiting for its timer.
pub const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// Where a segment's payload sits within the application message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Part {
    /// The whole message.
    #[default]
    Whole,
    /// Fragment `index` of a message split into `last + 1` fragments.
    Fragment { index: u8, last: u8 },
}

/// Byte accounting for one channel's outbound backlog.
#[derive(Debug)]
pub struct Backlog {
    channel: u8,
    pending: usize,
    capacity: usize,
    discarded_in_flight: usize,
}

impl Backlog {
    pub fn new(channel: u8, capacity: usize) -> Self {
        Self {
            channel,
            pending: 0,
            capacity,
            discarded_in_flight: 0,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Bytes queued or awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fits(&self, size: usize) -> bool {
        self.pending + size <= self.capacity
    }

    /// Account for `size` more bytes, failing if that would exceed capacity.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        if !self.fits(size) {
            return Err(TernStreamError::BacklogFull {
                channel: self.channel,
                pending: self.pending,
                size,
                capacity: self.capacity,
            });
        }
        self.pending += size;
        Ok(())
    }

    pub fn release(&mut self, size: usize) {
        self.pending = self.pending.saturating_sub(size);
    }

    /// Record bytes that were in flight when the sender discarded them.
    pub fn discard_in_flight(&mut self, size: usize) {
        self.discarded_in_flight += size;
    }

    /// Take the discarded in-flight byte count accumulated since the last call.
    pub fn take_discarded(&mut self) -> usize {
        std::mem::take(&mut self.discarded_in_flight)
    }
}

/// Upper bound on the backed-off delay between two transmissions.
pub const MAX_RETRANSMIT_DELAY: Duration = Duration::from_secs(60);

/// Retransmission schedule parameters for one transmit pass.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitTiming {
    /// Current retransmission timeout.
    pub rto: Duration,
    /// Multiplier applied per retransmission of the same segment.
    pub backoff: f32,
    /// Transmissions allowed before a segment is given up.
    pub fail_limit: u32,
}

impl RetransmitTiming {
    /// Delay before the next transmission of a segment already sent
    /// `transmissions` times.
    pub fn delay(&self, transmissions: u32) -> Duration {
        let exponent = transmissions.saturating_sub(1).min(64) as i32;
        if exponent == 0 {
            return self.rto;
        }
        let secs = self.rto.as_secs_f64() * f64::from(self.backoff).powi(exponent);
        Duration::from_secs_f64(secs.min(MAX_RETRANSMIT_DELAY.as_secs_f64()))
    }
}

/// What an acknowledgement released on one lane.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Number of segments acknowledged.
    pub acked: usize,
    /// Payload bytes acknowledged.
    pub acked_bytes: usize,
    /// RTT of the newest segment acknowledged after a single transmission.
    pub rtt_sample: Option<Duration>,
}

/// Counters produced by a transmit pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransmitReport {
    /// Payload bytes of segments sent for the first time.
    pub new_bytes: usize,
    /// Payload bytes of first transmissions counted against the congestion window.
    pub window_bytes: usize,
    /// Segments sent again, whether their timer expired or an
    /// acknowledgement reported them missing.
    pub retransmitted: usize,
    /// Those of `retransmitted` sent early on an acknowledgement.
    pub fast_retransmitted: usize,
    /// Payload bytes of those retransmissions.
    pub retransmitted_bytes: usize,
    /// Payload bytes given up without an acknowledgement.
    pub abandoned_bytes: usize,
    /// Time-limited segments dropped before their first transmission.
    pub expired: usize,
}

/// Shared state for one transmit pass over a peer's lanes.
pub struct TransmitContext<'a> {
    pub channel: u8,
    pub now: Instant,
    pub timing: RetransmitTiming,
    /// Bytes the congestion window still admits for first transmissions.
    pub allowance: usize,
    pub frames: &'a mut Vec<Frame>,
    pub report: TransmitReport,
}

/// Sending side of one lane.
pub trait TransportSender: Send {
    /// The delivery mode this lane implements.
    fn delivery(&self) -> Delivery;

    /// Queue `payload`, assigning it the next ordinal on this lane.
    fn send(&mut self, payload: Bytes, backlog: &mut Backlog) -> Result<Ordinal>;

    /// Queue `payload` to be dropped unsent once `expires` passes. Lanes
    /// that retransmit ignore the deadline.
    fn send_expiring(
        &mut self,
        payload: Bytes,
        _expires: Instant,
        backlog: &mut Backlog,
    ) -> Result<Ordinal> {
        self.send(payload, backlog)
    }

    /// Apply an acknowledgement from the remote receiver.
    fn on_ack(&mut self, next: Ordinal, bits: u32, now: Instant, backlog: &mut Backlog)
        -> AckOutcome;

    /// Append the frames due now. Fails when the connection must be dropped.
    fn transmit(&mut self, ctx: &mut TransmitContext<'_>, backlog: &mut Backlog) -> Result<()>;

    /// Whether nothing is queued or awaiting acknowledgement.
    fn is_idle(&self) -> bool;

    /// Drop everything queued, returning the bytes to the backlog.
    fn clear(&mut self, backlog: &mut Backlog);
}

/// Receiving side of one lane.
pub trait TransportReceiver: Send {
    /// The delivery mode this lane implements.
    fn delivery(&self) -> Delivery;

    /// Process an inbound segment. Returns messages ready for the
    /// application, in delivery order (possibly none).
    fn receive(
        &mut self,
        ordinal: Ordinal,
        base: Ordinal,
        part: Part,
        payload: Bytes,
        pool: &mut MemoryPool,
        flow: &mut FlowController,
    ) -> Result<Vec<Bytes>>;

    /// The acknowledgement to send, if one is owed. Clears the debt.
    fn take_ack(&mut self) -> Option<(Ordinal, u32)>;

    /// Release everything buffered.
    fn clear(&mut self, pool: &mut MemoryPool, flow: &mut FlowController);
}
