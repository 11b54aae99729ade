//! Per-flow state machine, readiness polling, send-side buffering, and
//! message-boundary handling, per `# 4.4`.
//!
//! Unlike `AddressCache`/`Resolver`/`HappyEyeballs`, a `Flow` owns its
//! socket directly (the ownership model of `# 5` assigns exactly one
//! component per OS handle, and here that component is the flow itself):
//! readiness is still reported by the `Context`'s reactor, but the actual
//! `recv`/`send` syscalls happen in this module rather than being relayed
//! through a command queue.

pub mod io;
pub mod send_queue;

use std::io as stdio;
use std::net::SocketAddr;

use socket2::Socket;
use transport_sockets::{SocketOptions, TransportProtocol};

use crate::error::{Error, Result};
use crate::reactor::Interest;
use io::ReassemblyBuffer;
use send_queue::SendQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    New,
    Opening,
    Connected,
    Draining,
    Idle,
    Listening,
    Closed,
}

/// What the `Context` must relay back to the application after driving a
/// flow. Unlike `ResolverEvent`/`Winner`, a flow can produce more than one
/// of these from a single readiness dispatch (e.g. `Readable` followed by
/// `AllWritten`), so the `Context` drains [`Flow::poll_event`] to
/// exhaustion after every call into the flow.
#[derive(Debug)]
pub enum FlowEvent {
    Connected,
    Readable,
    Writable,
    AllWritten,
    Error(Error),
}

/// One established or listening flow.
pub struct Flow {
    pub(crate) socket: Socket,
    protocol: TransportProtocol,
    options: SocketOptions,
    write_limit: usize,
    state: FlowState,
    send_queue: SendQueue,
    reassembly: Option<ReassemblyBuffer>,
    first_write_pending: bool,
    want_readable: bool,
    want_writable: bool,
    pending_events: std::collections::VecDeque<FlowEvent>,
}

impl Flow {
    /// Wraps a socket just committed by the happy-eyeballs engine (or a
    /// freshly accepted connection) into a `Flow` in the `OPENING` state
    /// with `firstWritePending` set, per `# 4.3`'s commit step.
    pub fn from_connecting(
        socket: Socket,
        protocol: TransportProtocol,
        options: SocketOptions,
    ) -> Self {
        let write_limit = match protocol {
            TransportProtocol::Sctp => options.write_buffer_size / 4,
            _ if options.write_buffer_size > 0 => options.write_buffer_size,
            _ => usize::MAX,
        };

        Self {
            socket,
            protocol,
            options,
            write_limit,
            state: FlowState::Opening,
            send_queue: SendQueue::new(),
            reassembly: (protocol == TransportProtocol::Sctp).then(ReassemblyBuffer::new),
            first_write_pending: true,
            want_readable: false,
            want_writable: true,
            pending_events: std::collections::VecDeque::new(),
        }
    }

    /// Wraps a socket returned by `accept()`: already connected, no
    /// `firstWritePending` dance, straight to `CONNECTED` with an
    /// immediate `on_connected` followed by a synthetic readiness
    /// dispatch, per `# 4.4`'s accept branch.
    pub fn from_accepted(socket: Socket, protocol: TransportProtocol, options: SocketOptions) -> Self {
        let write_limit = match protocol {
            TransportProtocol::Sctp => options.write_buffer_size / 4,
            _ if options.write_buffer_size > 0 => options.write_buffer_size,
            _ => usize::MAX,
        };

        let mut flow = Self {
            socket,
            protocol,
            options,
            write_limit,
            state: FlowState::Connected,
            send_queue: SendQueue::new(),
            reassembly: (protocol == TransportProtocol::Sctp).then(ReassemblyBuffer::new),
            first_write_pending: false,
            want_readable: true,
            want_writable: false,
            pending_events: std::collections::VecDeque::new(),
        };
        flow.pending_events.push_back(FlowEvent::Connected);
        flow
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn is_atomic(&self) -> bool {
        match self.protocol {
            TransportProtocol::Tcp => false,
            TransportProtocol::Sctp => !self.options.sctp_explicit_eor,
            TransportProtocol::Udp | TransportProtocol::UdpLite => true,
        }
    }

    /// The interest mask the `Context` must register with the reactor,
    /// recomputed whenever callbacks or the drain state change.
    pub fn interest(&self) -> Interest {
        let read = self.want_readable;
        let write = self.want_writable || matches!(self.state, FlowState::Draining);
        Interest::from_flags(read, write)
    }

    pub fn set_wants_readable(&mut self, wants: bool) {
        self.want_readable = wants;
    }

    pub fn set_wants_writable(&mut self, wants: bool) {
        self.want_writable = wants;
    }

    pub fn poll_event(&mut self) -> Option<FlowEvent> {
        self.pending_events.pop_front()
    }

    /// Writable readiness on a flow still in `OPENING`: fires `on_connected`
    /// and clears `firstWritePending`, transitioning to `CONNECTED`. Every
    /// later writable readiness fires `on_writable` instead, and clears
    /// `wantWritable` once the send queue has fully drained so the
    /// interest mask doesn't keep requesting `WRITABLE` forever on an
    /// idle, already-writable socket.
    pub fn on_writable(&mut self) {
        if self.first_write_pending {
            self.first_write_pending = false;
            self.state = FlowState::Connected;
            self.pending_events.push_back(FlowEvent::Connected);
        } else {
            self.pending_events.push_back(FlowEvent::Writable);
        }

        if let Err(e) = self.drain() {
            if !matches!(e, Error::WouldBlock) {
                self.pending_events.push_back(FlowEvent::Error(e));
            }
            return;
        }

        if self.send_queue.is_empty() {
            if matches!(self.state, FlowState::Connected | FlowState::Draining) {
                self.state = FlowState::Idle;
            }
            self.pending_events.push_back(FlowEvent::AllWritten);
            self.want_writable = false;
        } else {
            self.state = FlowState::Draining;
            self.want_writable = true;
        }
    }

    /// Read readiness. For message-oriented protocols this may need
    /// several calls before a complete message is assembled; `on_readable`
    /// is only surfaced to the caller once it is, per `# 8`'s invariant.
    pub fn on_readable(&mut self) {
        if let Some(reassembly) = &mut self.reassembly {
            match reassembly.recv_once(io::socket_fd(&self.socket), self.options.read_buffer_size) {
                Ok(()) => {
                    if reassembly.is_complete() {
                        self.pending_events.push_back(FlowEvent::Readable);
                    }
                }
                Err(e) if e.kind() == stdio::ErrorKind::WouldBlock => {}
                Err(e) => self.pending_events.push_back(FlowEvent::Error(Error::Io(e))),
            }
        } else {
            self.pending_events.push_back(FlowEvent::Readable);
        }
    }

    /// `read(buf)`: delivers the assembled message for a message-oriented
    /// protocol, or a direct `recv` for everything else. Mirrors
    /// `WOULD_BLOCK` from the OS verbatim.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(reassembly) = &mut self.reassembly {
            if !reassembly.is_complete() {
                return Err(Error::WouldBlock);
            }
            let message = reassembly.take();
            if message.len() > buf.len() {
                return Err(Error::MessageTooBig);
            }
            buf[..message.len()].copy_from_slice(&message);
            return Ok(message.len());
        }

        match io::recv_direct(&self.socket, buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == stdio::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// `write(buf, n)`: the five-step algorithm of `# 4.4`.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.is_atomic() && self.options.write_buffer_size > 0 && buf.len() > self.options.write_buffer_size {
            return Err(Error::MessageTooBig);
        }

        match self.drain() {
            Ok(()) | Err(Error::WouldBlock) => {}
            Err(e) => return Err(e),
        }

        let mut remaining = buf;

        if self.send_queue.is_empty() && !remaining.is_empty() {
            let attempt = remaining.len().min(self.write_limit);
            let eor = attempt == remaining.len();
            match self.send_with_eor(&remaining[..attempt], eor && !self.is_atomic()) {
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == stdio::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if !remaining.is_empty() {
            let coalesce = !self.protocol.is_message_oriented() && self.protocol != TransportProtocol::Sctp
                || (self.protocol == TransportProtocol::Sctp && !self.options.sctp_explicit_eor);
            self.send_queue.enqueue(remaining, true, coalesce);
        }

        self.update_drain_state();
        Ok(())
    }

    /// Repeats drain steps until the queue is empty or `WouldBlock`.
    fn drain(&mut self) -> Result<()> {
        loop {
            let Some(message) = self.send_queue.front_mut() else {
                return Ok(());
            };
            if message.is_empty() {
                self.send_queue.pop_if_empty();
                continue;
            }

            let remaining = message.remaining();
            let attempt = remaining.len().min(self.write_limit);
            let eor = message.eor && attempt == remaining.len();

            match self.send_with_eor(&remaining[..attempt], eor) {
                Ok(0) => return Err(Error::WouldBlock),
                Ok(n) => {
                    let message = self.send_queue.front_mut().expect("just matched Some above");
                    message.offset += n;
                }
                Err(e) if e.kind() == stdio::ErrorKind::WouldBlock => return Err(Error::WouldBlock),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn update_drain_state(&mut self) {
        if self.send_queue.is_empty() {
            if matches!(self.state, FlowState::Draining) {
                self.state = FlowState::Idle;
            }
            self.pending_events.push_back(FlowEvent::AllWritten);
            self.want_writable = false;
        } else {
            self.state = FlowState::Draining;
            self.want_writable = true;
        }
    }

    fn send_with_eor(&self, buf: &[u8], eor: bool) -> stdio::Result<usize> {
        io::send_with_eor(&self.socket, buf, eor && self.protocol == TransportProtocol::Sctp)
    }
}

/// A listening flow: accept-only, per `# 4.4`'s Listen/Accept section.
pub struct Listener {
    socket: Socket,
    protocol: TransportProtocol,
}

impl Listener {
    pub fn bind(protocol: TransportProtocol, addr: SocketAddr, backlog: i32) -> stdio::Result<Self> {
        let socket = transport_sockets::listen_socket(protocol, addr, backlog)?;
        Ok(Self { socket, protocol })
    }

    /// Performs the OS `accept()` and wraps the result straight into a
    /// connected `Flow`, inheriting this listener's protocol/options.
    pub fn accept(&self) -> stdio::Result<(Flow, SocketAddr)> {
        let (socket, addr) = self.socket.accept()?;
        socket.set_nonblocking(true)?;

        let mut options = SocketOptions::default();
        options.write_buffer_size = socket.send_buffer_size().unwrap_or(0);
        options.read_buffer_size = socket.recv_buffer_size().unwrap_or(0);
        if self.protocol == TransportProtocol::Tcp {
            options.nodelay = socket.set_nodelay(true).is_ok();
        }

        let peer = addr.as_socket().ok_or_else(|| {
            stdio::Error::new(stdio::ErrorKind::InvalidData, "accepted peer address is not IP")
        })?;

        Ok((Flow::from_accepted(socket, self.protocol, options), peer))
    }

    pub fn interest(&self) -> Interest {
        Interest::from_flags(true, false)
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_flow() -> Flow {
        let prepared = transport_sockets::candidate_socket(
            TransportProtocol::Udp,
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();
        Flow::from_connecting(prepared.socket, TransportProtocol::Udp, prepared.options)
    }

    #[test]
    fn opening_flow_fires_connected_on_first_writable() {
        let mut flow = udp_flow();
        assert_eq!(flow.state(), FlowState::Opening);

        flow.on_writable();

        let mut saw_connected = false;
        while let Some(event) = flow.poll_event() {
            if matches!(event, FlowEvent::Connected) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
        assert_eq!(flow.state(), FlowState::Idle);
    }

    #[test]
    fn connect_handshake_does_not_leave_write_interest_stuck() {
        let mut flow = udp_flow();
        flow.on_writable();
        while flow.poll_event().is_some() {}

        // Once the handshake's first writable readiness has been handled
        // and the (empty) send queue has drained, nothing should still
        // want WRITABLE: a connected, idle socket is always writable, so
        // leaving the bit set would busy-poll forever.
        assert!(!flow.interest().writable());
    }

    #[test]
    fn second_writable_after_connect_fires_writable_not_connected() {
        let mut flow = udp_flow();
        flow.on_writable();
        while flow.poll_event().is_some() {}

        flow.on_writable();
        let mut saw_writable = false;
        let mut saw_connected_again = false;
        while let Some(event) = flow.poll_event() {
            match event {
                FlowEvent::Writable => saw_writable = true,
                FlowEvent::Connected => saw_connected_again = true,
                _ => {}
            }
        }
        assert!(saw_writable);
        assert!(!saw_connected_again);
    }

    #[test]
    fn udp_atomicity_rejects_oversized_write_when_limit_known() {
        let mut flow = udp_flow();
        flow.options.write_buffer_size = 10;
        flow.write_limit = 10;

        let big = vec![0u8; 100];
        assert!(matches!(flow.write(&big), Err(Error::MessageTooBig)));
    }

    #[test]
    fn interest_includes_write_while_draining() {
        let mut flow = udp_flow();
        flow.state = FlowState::Draining;
        flow.want_writable = true;
        let interest = flow.interest();
        assert!(interest.writable());
    }
}
