//! The external "Reactor" port of `# 2 SYSTEM OVERVIEW`: non-blocking
//! readiness events, timers, and socket registration. The sans-IO cores
//! only ever see [`Interest`]/[`Token`]/[`Events`]; how readiness is
//! actually sourced (mio, a hand-rolled epoll loop, ...) is a pluggable
//! implementation detail behind the [`Reactor`] trait.

#[cfg(feature = "mio-reactor")]
pub mod mio_reactor;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Opaque identifier a `Reactor` hands back on registration and echoes in
/// every [`Events`] entry so the `Context` can demux readiness back to the
/// flow/candidate/DNS-pair socket it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// What a registration is interested in. Recomputed by flows/candidates
/// whenever their drain state or callback registration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { read: true, write: false };
    pub const WRITABLE: Interest = Interest { read: false, write: true };
    pub const NONE: Interest = Interest { read: false, write: false };

    pub fn from_flags(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    pub fn readable(self) -> bool {
        self.read
    }

    pub fn writable(self) -> bool {
        self.write
    }

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    pub fn combine(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }
}

/// One readiness report for a registered [`Token`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// A batch of readiness reports from one [`Reactor::poll`] call.
pub trait Events {
    fn iter(&self) -> Box<dyn Iterator<Item = Event> + '_>;
}

/// The event-loop primitive the `Context` drives. Non-goal per `# 1`:
/// embedding this inside a foreign event loop; a `Reactor` owns its own
/// poll/epoll/kqueue instance.
pub trait Reactor {
    type Events: Events;

    /// Registers `fd` under `token` for `interest`.
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Replaces a registration's interest set. Per `# 4.4`: an `interest`
    /// of [`Interest::NONE`] should instead go through [`Self::deregister`].
    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks for at most `timeout` (or indefinitely if `None`) and
    /// returns whatever readiness fired. `Some(Duration::ZERO)` is a
    /// non-blocking poll, used by `Context::run_nowait`.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Self::Events>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_combine_is_a_union() {
        let combined = Interest::READABLE.combine(Interest::WRITABLE);
        assert!(combined.readable());
        assert!(combined.writable());
    }

    #[test]
    fn empty_interest_has_neither_direction() {
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::READABLE.is_empty());
    }
}
