//! Congestion control.
//!
//! Only new segments are gated by the window; acknowledgements, pings,
//! handshake packets and unreliable segments always go out.

pub mod cubic;

/// A congestion window fed by transmission, acknowledgement and loss.
pub trait CongestionController: Send {
    /// `bytes` of segments were put on the wire.
    fn on_packet_sent(&mut self, bytes: usize);

    /// `bytes` of segments were acknowledged.
    fn on_ack(&mut self, bytes: usize);

    /// `bytes` of segments are presumed lost: retransmitted, abandoned or
    /// discarded before acknowledgement.
    fn on_loss(&mut self, bytes: usize);

    /// Congestion window in bytes.
    fn window(&self) -> usize;

    fn bytes_in_flight(&self) -> usize;

    fn can_send(&self, bytes: usize) -> bool {
        self.bytes_in_flight() + bytes <= self.window()
    }

    /// Bytes that may still be put in flight.
    fn allowance(&self) -> usize {
        self.window().saturating_sub(self.bytes_in_flight())
    }
}
