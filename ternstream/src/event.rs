use bytes::Bytes;

use crate::peer::{Peer, PeerReason};
use crate::transport::Delivery;

/// Something that happened on the I/O thread, in per-peer order.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection finished its handshake.
    Connection(Peer),
    /// A peer left. Follows its `Connection` event, or the `connect` call
    /// for attempts that never completed.
    Disconnection { peer: Peer, reason: PeerReason },
    /// A message arrived.
    Data {
        peer: Peer,
        channel: u8,
        delivery: Delivery,
        payload: Bytes,
    },
}

impl Event {
    pub fn peer(&self) -> &Peer {
        match self {
            Event::Connection(peer)
            | Event::Disconnection { peer, .. }
            | Event::Data { peer, .. } => peer,
        }
    }
}
