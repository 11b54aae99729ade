//! Receive-side plumbing: the plain non-blocking read path for
//! stream/datagram protocols, and the reassembly buffer message-oriented
//! protocols (SCTP) need to detect a complete record.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use bytes::{Bytes, BytesMut};

/// `MSG_EOR` is not exposed as a `libc` constant on every target that
/// defines it identically; the value is stable across Linux/FreeBSD/macOS.
const MSG_EOR: i32 = 0x80;

/// Per `# 4.4`: `max(8 KiB, ceil(read_size/4) rounded up to 8 KiB)`.
fn grow_threshold(read_size: usize) -> usize {
    const PAGE: usize = 8192;
    let quarter = read_size.div_ceil(4);
    let rounded = (quarter + (PAGE - 1)) & !(PAGE - 1);
    rounded.max(PAGE)
}

/// The per-flow reassembly buffer for message-oriented protocols.
///
/// Readiness dispatch to the user is withheld until a full message (an
/// `MSG_EOR`-flagged receive, or EOF) has accumulated; `# 8`'s invariant
/// that `on_readable` never fires on a partial message lives here.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    buf: BytesMut,
    complete: bool,
    eof: bool,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// The assembled message once `is_complete()`. Clears the buffer for
    /// the next message. `Bytes` is a refcounted handle onto the same
    /// allocation, so handing the message to a caller that only inspects it
    /// (rather than writing it into their own `buf`) costs no copy.
    pub fn take(&mut self) -> Bytes {
        self.complete = false;
        std::mem::take(&mut self.buf).freeze()
    }

    /// Grows the buffer if its free space is below this protocol's growth
    /// threshold, then performs one `recvmsg` and appends whatever arrived.
    /// Declares the message complete on `MSG_EOR` or a zero-byte read (EOF).
    pub fn recv_once(&mut self, fd: RawFd, read_size: usize) -> io::Result<()> {
        let threshold = grow_threshold(read_size);
        let free = self.buf.capacity() - self.buf.len();
        if free < threshold {
            self.buf.reserve(threshold - free);
        }

        let start = self.buf.len();
        let spare = self.buf.capacity() - start;
        self.buf.resize(start + spare.max(threshold), 0);

        let (n, eor) = recvmsg_with_eor(fd, &mut self.buf[start..])?;
        self.buf.truncate(start + n);

        if n == 0 {
            self.eof = true;
            self.complete = true;
        } else if eor {
            self.complete = true;
        }

        Ok(())
    }
}

/// Reads into `buf` via `recvmsg`, returning the byte count and whether
/// `MSG_EOR` was set on the returned flags.
fn recvmsg_with_eor(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, bool)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // SAFETY: `msg` points only at stack-local `iov`, which in turn points
    // at `buf`'s live allocation for the duration of this call.
    let rv = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }

    let eor = msg.msg_flags & MSG_EOR != 0;
    Ok((rv as usize, eor))
}

/// Plain non-blocking receive for stream/datagram protocols: no
/// reassembly, `WouldBlock` surfaces verbatim on `EAGAIN`.
pub fn recv_direct(socket: &socket2::Socket, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `socket2::Socket::recv` takes `&mut [MaybeUninit<u8>]`; `buf`
    // is plain initialized memory we're about to overwrite in full or in
    // part, which satisfies that contract.
    let uninit = unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len())
    };
    socket.recv(uninit)
}

pub fn socket_fd(socket: &socket2::Socket) -> RawFd {
    socket.as_raw_fd()
}

/// Sends `buf` in one `sendmsg` call, optionally flagging it as a
/// complete SCTP record (`MSG_EOR`) when the whole message fits.
pub fn send_with_eor(socket: &socket2::Socket, buf: &[u8], eor: bool) -> io::Result<usize> {
    let fd = socket.as_raw_fd();
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let flags = if eor { MSG_EOR } else { 0 };

    // SAFETY: `msg` points only at stack-local `iov`, which points at
    // `buf`'s live, immutable allocation for the duration of this call.
    let rv = unsafe { libc::sendmsg(fd, &msg, flags) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rv as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_threshold_has_an_8kib_floor() {
        assert_eq!(grow_threshold(0), 8192);
        assert_eq!(grow_threshold(1000), 8192);
    }

    #[test]
    fn grow_threshold_scales_with_read_size() {
        // 64 KiB / 4 = 16 KiB, already 8 KiB aligned.
        assert_eq!(grow_threshold(65536), 16384);
    }

    #[test]
    fn fresh_reassembly_buffer_is_incomplete() {
        let buf = ReassemblyBuffer::new();
        assert!(!buf.is_complete());
        assert!(!buf.is_eof());
    }
}
