//! mio readiness backend.
//!
//! Uses epoll on Linux, kqueue on macOS. Descriptors are registered by
//! raw fd (`SourceFd`) with the fd doubling as the token, because
//! connections migrate between sessions and must be re-registered with
//! a different reactor than the one that first saw them. mio delivers
//! edge-triggered notifications, which is the contract the session read
//! handler is written against.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use super::{Event, Interest};

pub struct PollBackend {
    poll: Poll,
    events: Events,
}

impl PollBackend {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity.max(1)),
        })
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            mio_interest(interest),
        )
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    pub fn poll(&mut self, timeout: Duration, ready: &mut Vec<Event>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            // Signal delivery during the wait looks like a timeout.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            ready.push(Event {
                fd: event.token().0 as RawFd,
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_error() || event.is_read_closed(),
            });
        }
        Ok(())
    }
}

fn mio_interest(interest: Interest) -> mio::Interest {
    if interest.writable {
        mio::Interest::READABLE.add(mio::Interest::WRITABLE)
    } else {
        mio::Interest::READABLE
    }
}
