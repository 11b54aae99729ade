//! Default `Reactor` implementation backed by `mio`, feature-gated behind
//! `mio-reactor` (on by default) the same way the rest of this corpus
//! keeps its heavier runtime dependencies optional.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events as MioEvents, Poll};

use super::{Event, Events, Interest, Reactor, Token};

pub struct MioReactor {
    poll: Poll,
    events: MioEvents,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: MioEvents::with_capacity(1024),
        })
    }
}

fn to_mio_interest(interest: Interest) -> mio::Interest {
    match (interest.readable(), interest.writable()) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        (false, false) => mio::Interest::READABLE,
    }
}

impl Reactor for MioReactor {
    type Events = MioEventsSnapshot;

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), mio::Token(token.0 as usize), to_mio_interest(interest))
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), mio::Token(token.0 as usize), to_mio_interest(interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Self::Events> {
        self.poll.poll(&mut self.events, timeout)?;

        let entries = self
            .events
            .iter()
            .map(|e| Event {
                token: Token(e.token().0 as u64),
                readable: e.is_readable(),
                writable: e.is_writable(),
            })
            .collect();

        Ok(MioEventsSnapshot { entries })
    }
}

pub struct MioEventsSnapshot {
    entries: Vec<Event>,
}

impl Events for MioEventsSnapshot {
    fn iter(&self) -> Box<dyn Iterator<Item = Event> + '_> {
        Box::new(self.entries.iter().copied())
    }
}
