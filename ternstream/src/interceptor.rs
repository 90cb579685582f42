//! Raw datagram interception.

use std::net::SocketAddr;

/// Hook into every datagram a host receives or sends.
///
/// Runs on the I/O thread. Returning `false` drops the datagram, which is
/// how tests simulate loss. Either hook may rewrite the bytes in place.
pub trait Interceptor: Send {
    /// Called with each received datagram before it is decoded.
    fn on_receive(&mut self, addr: &SocketAddr, data: &mut [u8]) -> bool;

    /// Called with each encoded datagram before it is written to the socket.
    fn on_send(&mut self, addr: &SocketAddr, data: &mut Vec<u8>) -> bool;
}
