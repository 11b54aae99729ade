//! Non-blocking socket construction for the transport-services core.
//!
//! This crate knows how to allocate a raw, non-blocking socket for one of the
//! four protocols the core races in happy-eyeballs (TCP, UDP, SCTP, UDP-Lite),
//! apply the best-effort socket options the core relies on, and read back the
//! kernel's send/receive buffer sizes. It does not know anything about
//! candidates, flows, or readiness polling; that lives in `transport-services`.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// The wire protocol a candidate or flow is using.
///
/// Mirrors the finite protocol enumeration the property mask can select from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Sctp,
    UdpLite,
}

impl TransportProtocol {
    /// The socket type a protocol is carried over: stream or datagram.
    pub fn socket_type(self) -> SocketKind {
        match self {
            TransportProtocol::Tcp | TransportProtocol::Sctp => SocketKind::Stream,
            TransportProtocol::Udp | TransportProtocol::UdpLite => SocketKind::Datagram,
        }
    }

    /// Whether a single `write` call on this protocol must be delivered as one
    /// unit, i.e. the kernel never splits or coalesces it with other writes.
    ///
    /// SCTP is atomic only when the `SCTP_EXPLICIT_EOR` socket option failed
    /// to apply; callers combine this with [`SocketOptions::sctp_explicit_eor`].
    pub fn is_message_oriented(self) -> bool {
        matches!(self, TransportProtocol::Udp | TransportProtocol::UdpLite)
    }

    fn socket2_protocol(self) -> Option<Protocol> {
        match self {
            TransportProtocol::Tcp => Some(Protocol::TCP),
            TransportProtocol::Udp => Some(Protocol::UDP),
            TransportProtocol::Sctp => Some(Protocol::from(SCTP_PROTO_NUM)),
            TransportProtocol::UdpLite => Some(Protocol::from(UDPLITE_PROTO_NUM)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

// IANA protocol numbers; not exposed by `socket2::Protocol` as constants.
const SCTP_PROTO_NUM: i32 = 132;
const UDPLITE_PROTO_NUM: i32 = 136;

/// Best-effort options applied to a freshly allocated candidate socket.
///
/// Every field records whether the option actually took, since the core
/// needs to know this (e.g. `sctp_explicit_eor` decides atomicity of writes).
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub sctp_explicit_eor: bool,
    pub write_buffer_size: usize,
    pub read_buffer_size: usize,
}

/// A freshly allocated, non-blocking, not-yet-connected socket plus the
/// options that were applied to it.
pub struct PreparedSocket {
    pub socket: Socket,
    pub protocol: TransportProtocol,
    pub options: SocketOptions,
}

/// Allocates a non-blocking socket for `protocol`, bound to nothing yet,
/// sized to connect towards a peer of the same family as `local_hint`.
///
/// Applies `TCP_NODELAY` for TCP, `SCTP_NODELAY`/`SCTP_EXPLICIT_EOR` for
/// SCTP, and reads back the kernel's send/receive buffer sizes, exactly as
/// the happy-eyeballs engine needs before it starts a non-blocking connect.
pub fn candidate_socket(protocol: TransportProtocol, local_hint: SocketAddr) -> io::Result<PreparedSocket> {
    let domain = Domain::for_address(local_hint);
    let ty = match protocol.socket_type() {
        SocketKind::Stream => Type::STREAM,
        SocketKind::Datagram => Type::DGRAM,
    };

    let socket = Socket::new(domain, ty, protocol.socket2_protocol())?;
    socket.set_nonblocking(true)?;

    if domain == Domain::IPV6 {
        // IPV6_V6ONLY is invalid on AF_INET sockets; only ever touch it here.
        let _ = socket.set_only_v6(true);
    }

    let mut options = SocketOptions::default();

    match protocol {
        TransportProtocol::Tcp => {
            if socket.set_nodelay(true).is_ok() {
                options.nodelay = true;
            }
        }
        TransportProtocol::Sctp => {
            options.nodelay = apply_sctp_nodelay(&socket);
            options.sctp_explicit_eor = apply_sctp_explicit_eor(&socket);
        }
        TransportProtocol::Udp | TransportProtocol::UdpLite => {}
    }

    options.write_buffer_size = socket.send_buffer_size().unwrap_or(0);
    options.read_buffer_size = socket.recv_buffer_size().unwrap_or(0);

    tracing::trace!(?protocol, ?options, "allocated candidate socket");

    Ok(PreparedSocket {
        socket,
        protocol,
        options,
    })
}

/// Allocates and binds a listening socket: same option set as
/// [`candidate_socket`], plus `SO_REUSEADDR` and, for connection-oriented
/// protocols, a `listen(backlog)` call.
pub fn listen_socket(
    protocol: TransportProtocol,
    bind_addr: SocketAddr,
    backlog: i32,
) -> io::Result<Socket> {
    let prepared = candidate_socket(protocol, bind_addr)?;
    let socket = prepared.socket;

    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(bind_addr))?;

    if matches!(prepared.protocol.socket_type(), SocketKind::Stream) {
        socket.listen(backlog)?;
    }

    Ok(socket)
}

/// Begins a non-blocking `connect()`. Per POSIX this returns `EINPROGRESS`
/// (surfaced by `socket2`/`std` as [`io::ErrorKind::WouldBlock`] on Unix
/// nonblocking sockets going through `connect`), which is not an error from
/// the caller's perspective: the happy-eyeballs engine registers for
/// writable readiness and inspects `SO_ERROR` once it fires.
pub fn begin_connect(socket: &Socket, dst: SocketAddr) -> io::Result<()> {
    match socket.connect(&SockAddr::from(dst)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || raw_in_progress(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn raw_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Consults `SO_ERROR` on a socket that just became writable.
///
/// Per the NEAT happy-eyeballs bug this specification intentionally fixes:
/// the winner is the first candidate whose writable readiness arrives *and*
/// whose pending socket error is `0`, not merely the first one to become
/// writable.
pub fn take_pending_error(socket: &Socket) -> io::Result<()> {
    match socket.take_error()? {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn apply_sctp_nodelay(socket: &Socket) -> bool {
    set_sctp_flag(socket, libc::IPPROTO_SCTP, SCTP_NODELAY)
}

fn apply_sctp_explicit_eor(socket: &Socket) -> bool {
    set_sctp_flag(socket, libc::IPPROTO_SCTP, SCTP_EXPLICIT_EOR)
}

// Not exposed by libc on all targets; values are stable across Linux/FreeBSD.
const SCTP_NODELAY: libc::c_int = 3;
const SCTP_EXPLICIT_EOR: libc::c_int = 25;

fn set_sctp_flag(socket: &Socket, level: libc::c_int, name: libc::c_int) -> bool {
    let enable: libc::c_int = 1;
    let fd = socket.as_raw_fd();

    // SAFETY: `fd` is a valid, open socket owned by `socket` for the duration
    // of this call; `enable` lives on the stack and matches the expected
    // `c_int` width for these SCTP options.
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    rv == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_is_stream_and_splittable() {
        assert_eq!(TransportProtocol::Tcp.socket_type(), SocketKind::Stream);
        assert!(!TransportProtocol::Tcp.is_message_oriented());
    }

    #[test]
    fn udp_and_udplite_are_message_oriented_datagrams() {
        assert_eq!(TransportProtocol::Udp.socket_type(), SocketKind::Datagram);
        assert!(TransportProtocol::Udp.is_message_oriented());
        assert_eq!(TransportProtocol::UdpLite.socket_type(), SocketKind::Datagram);
        assert!(TransportProtocol::UdpLite.is_message_oriented());
    }

    #[test]
    fn sctp_is_stream_but_not_unconditionally_message_oriented() {
        assert_eq!(TransportProtocol::Sctp.socket_type(), SocketKind::Stream);
        assert!(!TransportProtocol::Sctp.is_message_oriented());
    }

    #[test]
    fn allocate_tcp_v4_candidate_socket() {
        let prepared = candidate_socket(
            TransportProtocol::Tcp,
            "127.0.0.1:0".parse().unwrap(),
        )
        .expect("allocating a TCP socket must succeed in a test sandbox");

        assert!(prepared.options.nodelay);
        assert_eq!(prepared.protocol, TransportProtocol::Tcp);
    }

    #[test]
    fn allocate_udp_v6_candidate_socket() {
        let prepared = candidate_socket(TransportProtocol::Udp, "[::1]:0".parse().unwrap())
            .expect("allocating a UDP socket must succeed in a test sandbox");

        assert_eq!(prepared.protocol, TransportProtocol::Udp);
    }
}
