//! Receive-side flow control.
//!
//! Out-of-order segments wait in the reordering trees until the gap before
//! them closes. The bytes a peer may hold there, across all of its channels,
//! are capped by the downstream window. A segment that would exceed the cap
//! is dropped unacknowledged and the sender retransmits it later.

use std::collections::HashMap;

use crate::error::{Result, TernStreamError};

/// Tracks bytes buffered for reordering against a per-peer window.
#[derive(Debug)]
pub struct FlowController {
    /// Total bytes the peer may have buffered.
    window: usize,
    /// Bytes currently buffered, across channels.
    buffered: usize,
    /// Per-channel share of `buffered`.
    channels: HashMap<u8, usize>,
}

impl FlowController {
    /// Create a controller admitting up to `window` buffered bytes.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            buffered: 0,
            channels: HashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Bytes currently buffered across all channels.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Bytes currently buffered on one channel.
    pub fn buffered_on(&self, channel: u8) -> usize {
        self.channels.get(&channel).copied().unwrap_or(0)
    }

    /// Bytes that may still be buffered.
    pub fn available(&self) -> usize {
        self.window.saturating_sub(self.buffered)
    }

    /// Account for `size` bytes buffered on `channel`.
    pub fn consume(&mut self, channel: u8, size: usize) -> Result<()> {
        if size > self.available() {
            return Err(TernStreamError::ReceiveWindowFull {
                buffered: self.buffered,
                size,
                window: self.window,
            });
        }
        self.buffered += size;
        *self.channels.entry(channel).or_insert(0) += size;
        Ok(())
    }

    /// Return `size` bytes previously consumed on `channel`.
    pub fn release(&mut self, channel: u8, size: usize) {
        if let Some(used) = self.channels.get_mut(&channel) {
            let size = size.min(*used);
            *used -= size;
            self.buffered -= size;
            if *used == 0 {
                self.channels.remove(&channel);
            }
        }
    }
}
