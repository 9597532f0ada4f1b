//! Readiness multiplexer: a thin state machine over `mio::Poll` (epoll).
//!
//! The poller owns the fd → channel map and reconciles each channel's
//! desired interest with the kernel registration:
//!
//! - `Detached`/`Parked` + non-empty interest → register, mark `Registered`
//! - `Registered` + empty interest → deregister, mark `Parked`
//! - `Registered` + non-empty interest → reregister
//!
//! All mutators run on the owning loop's thread; the [`EventLoop`](crate::event_loop::EventLoop)
//! wrapper enforces that before calling in.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, trace};

use crate::channel::{
    Channel, PollerState, READ_EVENT, REV_CLOSED, REV_ERROR, REV_READABLE, REV_WRITABLE,
    WRITE_EVENT,
};

/// Initial readiness event buffer size; doubles whenever a poll fills it.
const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Arc<Channel>>,
}

fn mio_interest(mask: u8) -> Option<Interest> {
    match (mask & READ_EVENT != 0, mask & WRITE_EVENT != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    /// Block until readiness or timeout, then append the ready channels to
    /// `active` with their realized readiness latched.
    ///
    /// Interrupted waits are silent. Any other wait failure is logged and
    /// yields an empty set.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Channel>>) {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                error!(error = %e, "poll failed");
                return;
            }
        }

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            let fd = event.token().0 as RawFd;
            let channel = match self.channels.get(&fd) {
                Some(ch) => ch,
                None => continue,
            };

            let mut revents = 0;
            if event.is_readable() || event.is_priority() {
                revents |= REV_READABLE;
            }
            if event.is_writable() {
                revents |= REV_WRITABLE;
            }
            if event.is_error() {
                revents |= REV_ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                revents |= REV_CLOSED;
            }

            channel.set_revents(revents);
            active.push(Arc::clone(channel));
        }

        if count > 0 {
            trace!(events = count, "poll returned");
        }

        // Fully consumed: grow so a storm is absorbed in fewer wakeups.
        if count == self.events.capacity() {
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let state = channel.poller_state();
        trace!(fd, interest = channel.interest(), ?state, "update channel");

        match state {
            PollerState::Detached | PollerState::Parked => {
                if state == PollerState::Detached {
                    assert!(
                        !self.channels.contains_key(&fd),
                        "fd {fd} already owned by another channel"
                    );
                    self.channels.insert(fd, Arc::clone(channel));
                } else {
                    self.assert_known(channel);
                }
                match mio_interest(channel.interest()) {
                    Some(interest) => {
                        self.register(fd, interest);
                        channel.set_poller_state(PollerState::Registered);
                    }
                    // Nothing to arm yet; stay parked in the map.
                    None => channel.set_poller_state(PollerState::Parked),
                }
            }
            PollerState::Registered => {
                self.assert_known(channel);
                match mio_interest(channel.interest()) {
                    Some(interest) => self.reregister(fd, interest),
                    None => {
                        self.deregister(fd);
                        channel.set_poller_state(PollerState::Parked);
                    }
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.assert_known(channel);
        assert!(
            channel.is_none_interest(),
            "fd {fd} removed while interest is non-empty"
        );

        let state = channel.poller_state();
        assert!(
            state == PollerState::Registered || state == PollerState::Parked,
            "fd {fd} removed while detached"
        );

        self.channels.remove(&fd);
        if state == PollerState::Registered {
            self.deregister(fd);
        }
        channel.set_poller_state(PollerState::Detached);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| Arc::ptr_eq(known, channel))
    }

    fn assert_known(&self, channel: &Arc<Channel>) {
        let known = self
            .channels
            .get(&channel.fd())
            .unwrap_or_else(|| panic!("fd {} is not in the poller map", channel.fd()));
        assert!(
            Arc::ptr_eq(known, channel),
            "fd {} is mapped to a different channel",
            channel.fd()
        );
    }

    fn register(&mut self, fd: RawFd, interest: Interest) {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            panic!("epoll register failed for fd {fd}: {e}");
        }
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) {
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            panic!("epoll reregister failed for fd {fd}: {e}");
        }
    }

    fn deregister(&mut self, fd: RawFd) {
        // Removal failures are survivable: the fd may already be gone.
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            error!(fd, error = %e, "epoll deregister failed");
        }
    }
}
