//! Host configuration.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Smallest MTU a host accepts (the IPv4 minimum reassembly size).
pub const MIN_MTU: u16 = 576;
/// Largest window a stream may configure: 1 GiB.
pub const MAX_WINDOW: usize = 1 << 30;

/// Per-direction stream limits.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamSettings {
    /// Window capacity in bytes.
    pub window: usize,
    /// Acceptable loss ratio in `[0, 1]`.
    pub loss: f32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            window: 1 << 20,
            loss: 0.1,
        }
    }
}

impl StreamSettings {
    pub fn new(window: usize, loss: f32) -> Self {
        Self { window, loss }
    }

    fn validated(self, mtu: u16) -> Self {
        let loss = if self.loss.is_nan() { 0.0 } else { self.loss };
        Self {
            window: self.window.clamp(usize::from(mtu), MAX_WINDOW),
            loss: loss.clamp(0.0, 1.0),
        }
    }
}

/// Settings applied to every connection of a host.
///
/// Outbound (`upstream`) limits bound each channel's send backlog and the
/// loss this side tolerates; inbound (`downstream`) limits bound the bytes a
/// peer may park out of order and are advertised during the handshake.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Settings {
    /// Maximum number of simultaneous peers.
    pub capacity: usize,
    /// Channels per connection (MTC).
    pub max_channels: u8,
    /// Largest datagram, IP and UDP headers included.
    pub mtu: u16,
    /// Initial retransmission timeout and floor of the adaptive one.
    pub resend_timeout: Duration,
    /// Multiplier applied to the timeout on each retransmission.
    pub ack_backoff: f32,
    /// Transmissions of one segment before the connection times out.
    pub ack_fail_limit: u8,
    /// Inbound silence after which a peer is considered lost.
    pub connection_timeout: Duration,
    /// Outbound silence after which a keep-alive is sent.
    pub idle_timeout: Duration,
    /// Socket receive timeout of the I/O loop.
    pub poll_interval: Duration,
    /// IP time-to-live of outgoing datagrams.
    pub ttl: u8,
    pub upstream: StreamSettings,
    pub downstream: StreamSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_channels: 1,
            mtu: 1280,
            resend_timeout: Duration::from_millis(500),
            ack_backoff: 1.25,
            ack_fail_limit: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            ttl: 64,
            upstream: StreamSettings::default(),
            downstream: StreamSettings::default(),
        }
    }
}

impl Settings {
    /// Clamp every field into its legal range.
    pub fn validated(self) -> Self {
        let mtu = self.mtu.max(MIN_MTU);
        let connection_timeout = self
            .connection_timeout
            .clamp(Duration::from_secs(1), Duration::from_secs(600));
        let ack_backoff = if self.ack_backoff.is_nan() {
            1.0
        } else {
            self.ack_backoff.clamp(1.0, 4.0)
        };
        Self {
            capacity: self.capacity.max(1),
            max_channels: self.max_channels.max(1),
            mtu,
            resend_timeout: self
                .resend_timeout
                .clamp(Duration::from_millis(1), Duration::from_secs(60)),
            ack_backoff,
            ack_fail_limit: self.ack_fail_limit.max(1),
            connection_timeout,
            idle_timeout: self
                .idle_timeout
                .clamp(Duration::from_millis(10), connection_timeout),
            poll_interval: self
                .poll_interval
                .clamp(Duration::from_millis(1), Duration::from_millis(100)),
            ttl: self.ttl.max(1),
            upstream: self.upstream.validated(mtu),
            downstream: self.downstream.validated(mtu),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_channels(mut self, max_channels: u8) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_resend_timeout(mut self, timeout: Duration) -> Self {
        self.resend_timeout = timeout;
        self
    }

    pub fn with_ack_backoff(mut self, backoff: f32) -> Self {
        self.ack_backoff = backoff;
        self
    }

    pub fn with_ack_fail_limit(mut self, limit: u8) -> Self {
        self.ack_fail_limit = limit;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_upstream(mut self, upstream: StreamSettings) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_downstream(mut self, downstream: StreamSettings) -> Self {
        self.downstream = downstream;
        self
    }
}
