//! UDP socket creation.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, TernStreamError};
use crate::settings::Settings;

/// Bind a UDP socket for a host.
///
/// IPv6 sockets are dual-stack. Buffer sizes follow the stream windows and
/// reads time out after `poll_interval` so the I/O loop keeps ticking.
pub fn bind(addr: SocketAddr, settings: &Settings) -> Result<UdpSocket> {
    configure(addr, settings).map_err(|source| TernStreamError::Bind { addr, source })
}

fn configure(addr: SocketAddr, settings: &Settings) -> io::Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_recv_buffer_size(settings.downstream.window)?;
    socket.set_send_buffer_size(settings.upstream.window)?;
    match addr {
        SocketAddr::V4(_) => socket.set_ttl(u32::from(settings.ttl))?,
        SocketAddr::V6(_) => socket.set_unicast_hops_v6(u32::from(settings.ttl))?,
    }
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(settings.poll_interval))?;
    Ok(socket)
}

/// Express `remote` in the address family of a socket bound to `local`.
///
/// IPv4 destinations are mapped onto dual-stack IPv6 sockets; IPv6
/// destinations cannot be reached from an IPv4 socket.
pub fn reachable(local: SocketAddr, remote: SocketAddr) -> Result<SocketAddr> {
    match (local, remote) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) | (SocketAddr::V6(_), SocketAddr::V6(_)) => {
            Ok(remote)
        }
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => Ok(SocketAddr::new(
            IpAddr::V6(v4.ip().to_ipv6_mapped()),
            v4.port(),
        )),
        (SocketAddr::V4(_), SocketAddr::V6(_)) => {
            Err(TernStreamError::UnsupportedAddressFamily(remote))
        }
    }
}

/// Receive errors that leave the socket usable.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}
