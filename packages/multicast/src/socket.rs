//! Unified interface for the creation of sockets.

use std::net::SocketAddr;
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::logger;

/// The async socket type used in this crate.
pub use tokio_socket2::TokioSocket2 as AsyncSocket;

/// A helper function to describe a [`SockAddr`].
///
/// This is distinct from [`describe_socket_addr`] which is the [`std::net`] equivalent.
pub fn describe_sock_addr(sock_addr: &SockAddr) -> String {
    sock_addr
        .as_socket()
        .map(|sock_addr| describe_socket_addr(&sock_addr))
        .unwrap_or_else(|| "(Unknown source)".to_owned())
}

/// A helper function to describe a [`SocketAddr`].
///
/// This is distinct from [`describe_sock_addr`] which is the [`socket2`] equivalent.
pub fn describe_socket_addr(socket_addr: &SocketAddr) -> String {
    format!(
        "{ip}:{port}",
        ip = socket_addr.ip(),
        port = socket_addr.port()
    )
}

/// Create a generic UDP socket.
///
/// The resultant socket can be used for both sending and receiving datagrams.
///
/// By default, the socket will be:
/// - non-blocking,
/// - allow the reuse of the address (and of the port on unix), and
/// - bound to the given address.
pub fn create_udp(addr: &SocketAddr) -> io::Result<AsyncSocket> {
    let domain = Domain::for_address(*addr);

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(*addr))?;

    AsyncSocket::new(socket)
}

/// A short hand function to create a UDP socket bound to all IPv4 interfaces.
///
/// This is useful for creating a sender socket.
pub fn create_udp_all_v4_interfaces(port: u16) -> io::Result<AsyncSocket> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    create_udp(&addr)
}

/// Create a UDP socket bound to all IPv4 interfaces with broadcasting enabled.
///
/// The same socket is used to send to and to receive from the broadcast address.
pub fn create_broadcast(port: u16) -> io::Result<AsyncSocket> {
    let asocket = create_udp_all_v4_interfaces(port)?;
    asocket.get_ref().set_broadcast(true)?;

    Ok(asocket)
}

/// Create a UDP socket to receive traffic for the given multicast group.
///
/// On unix the socket is bound to the group address itself, so that several groups
/// sharing one port do not receive each other's datagrams. Other platforms do not
/// allow binding to a multicast address, and bind to all interfaces instead.
pub fn create_multicast_receiver(group: &SocketAddr) -> io::Result<AsyncSocket> {
    let bind_addr = if cfg!(unix) {
        *group
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port())
    };

    let asocket = create_udp(&bind_addr)?;
    join_multicast(&asocket, group)?;

    Ok(asocket)
}

/// Create a short-lived sender for multicast traffic with the given time-to-live.
///
/// Loopback is left enabled; whether the sender observes its own transmission is up
/// to the operating system and network.
pub fn create_multicast_sender(ttl: u32) -> io::Result<AsyncSocket> {
    let asocket = create_udp_all_v4_interfaces(0)?;
    let socket = asocket.get_ref();
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(true)?;

    Ok(asocket)
}

/// Check that the address is a multicast address.
fn ensure_multicast(ip_addr: &IpAddr) -> io::Result<()> {
    if ip_addr.is_multicast() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Address {ip_addr} is not a multicast address"),
        ))
    }
}

/// A helper function to set a socket to join a multicast address.
///
/// The resultant socket will listen for multicast messages on all interfaces.
pub fn join_multicast(asocket: &AsyncSocket, addr: &SocketAddr) -> io::Result<()> {
    let socket = asocket.get_ref();

    let ip_addr = addr.ip();
    ensure_multicast(&ip_addr)?;

    match ip_addr {
        IpAddr::V4(ref group_v4) => {
            socket.join_multicast_v4(group_v4, &Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(ref group_v6) => {
            // This does not work on macOS which REQUIRES an interface to be specified.
            socket.join_multicast_v6(group_v6, 0)?;
            socket.set_only_v6(true)?;
        }
    };

    logger::debug!("Joined multicast group {}.", describe_socket_addr(addr));
    Ok(())
}

/// A helper function to drop the membership of a multicast address.
///
/// This is the mirror of [`join_multicast`], and should be called before the socket
/// is closed.
pub fn leave_multicast(asocket: &AsyncSocket, addr: &SocketAddr) -> io::Result<()> {
    let socket = asocket.get_ref();

    let ip_addr = addr.ip();
    ensure_multicast(&ip_addr)?;

    match ip_addr {
        IpAddr::V4(ref group_v4) => {
            socket.leave_multicast_v4(group_v4, &Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(ref group_v6) => {
            socket.leave_multicast_v6(group_v6, 0)?;
        }
    };

    logger::debug!("Left multicast group {}.", describe_socket_addr(addr));
    Ok(())
}

/// A helper function to send a datagram, to a unicast, broadcast or multicast address.
pub async fn send_datagram(
    asocket: &AsyncSocket,
    addr: &SocketAddr,
    data: &[u8],
) -> io::Result<usize> {
    logger::debug!(
        "Sending {} bytes to {:?}.",
        data.len(),
        describe_socket_addr(addr)
    );
    asocket
        .write(|socket| socket.send_to(data, &SockAddr::from(*addr)))
        .await
}

/// A helper function to receive a datagram.
///
/// Any datagram larger than `buffer_size` is truncated.
pub async fn receive_datagram(
    asocket: &AsyncSocket,
    buffer_size: usize,
) -> io::Result<(Vec<u8>, SockAddr)> {
    let mut inner_buffer = vec![core::mem::MaybeUninit::uninit(); buffer_size];
    let result = asocket
        .read(|socket| socket.recv_from(&mut inner_buffer))
        .await;

    result.map(|(size, addr)| {
        logger::debug!(
            "Received {} bytes from {:?}.",
            size,
            describe_sock_addr(&addr)
        );

        // Only take the initialized part of the buffer.
        (
            (0..size)
                .map(|i| unsafe { inner_buffer[i].assume_init() })
                .collect::<Vec<_>>(),
            addr,
        )
    })
}
