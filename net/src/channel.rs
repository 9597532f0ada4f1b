//! Binding between a file descriptor and its owning event loop.
//!
//! A [`Channel`] carries the interest mask the owner wants from the kernel,
//! the readiness latched by the most recent poll, the poller registration
//! state, and the per-event callbacks. Channels are shared as `Arc` so the
//! active list produced by a poll can never dangle, but every mutation must
//! happen on the owning loop's thread; the mask fields are relaxed atomics
//! only to satisfy `Sync`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event_loop::EventLoop;

/// Interest mask bit: readable events.
pub const READ_EVENT: u8 = 0b01;
/// Interest mask bit: writable events.
pub const WRITE_EVENT: u8 = 0b10;

/// Readiness bits latched by the poller.
pub(crate) const REV_READABLE: u8 = 0b0001;
pub(crate) const REV_WRITABLE: u8 = 0b0010;
pub(crate) const REV_ERROR: u8 = 0b0100;
pub(crate) const REV_CLOSED: u8 = 0b1000;

/// Where the channel stands with respect to the poller's kernel registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PollerState {
    /// Never registered, or fully removed.
    Detached = 0,
    /// Currently registered with the kernel.
    Registered = 1,
    /// Previously registered, currently disarmed; still in the fd map so
    /// re-arming is a single syscall.
    Parked = 2,
}

impl PollerState {
    fn from_u8(v: u8) -> PollerState {
        match v {
            1 => PollerState::Registered,
            2 => PollerState::Parked,
            _ => PollerState::Detached,
        }
    }
}

type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

pub struct Channel {
    fd: RawFd,
    owner: Weak<EventLoop>,
    interest: AtomicU8,
    revents: AtomicU8,
    state: AtomicU8,
    handlers: Mutex<Handlers>,
}

impl Channel {
    pub fn new(owner: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Channel::from_weak(Arc::downgrade(owner), fd)
    }

    pub(crate) fn from_weak(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            owner,
            interest: AtomicU8::new(0),
            revents: AtomicU8::new(0),
            state: AtomicU8::new(PollerState::Detached as u8),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner.upgrade()
    }

    pub(crate) fn owner_ptr(&self) -> *const EventLoop {
        Weak::as_ptr(&self.owner)
    }

    pub fn set_read_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().read = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().write = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().close = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.handlers.lock().error = Some(Box::new(cb));
    }

    pub(crate) fn interest(&self) -> u8 {
        self.interest.load(Ordering::Relaxed)
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest() == 0
    }

    pub fn is_reading(&self) -> bool {
        self.interest() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest() & WRITE_EVENT != 0
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.interest.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.interest.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.interest.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.interest.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.interest.store(0, Ordering::Relaxed);
        self.update();
    }

    /// Push the current interest mask through to the owning loop's poller.
    fn update(self: &Arc<Self>) {
        if let Some(lp) = self.owner.upgrade() {
            lp.update_channel(self);
        }
    }

    /// Unregister from the poller entirely. Interest must already be empty.
    pub fn remove(self: &Arc<Self>) {
        assert!(self.is_none_interest(), "channel removed with live interest");
        if let Some(lp) = self.owner.upgrade() {
            lp.remove_channel(self);
        }
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_revents(&self, revents: u8) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    /// Interest cleared without touching the poller; used on teardown paths
    /// where the owning loop is no longer reachable through the weak ref.
    pub(crate) fn clear_interest(&self) {
        self.interest.store(0, Ordering::Relaxed);
    }

    /// Dispatch the latched readiness to the registered callbacks.
    ///
    /// Ordering mirrors the kernel semantics: a hangup with no pending data
    /// is a close, errors next, then read, then write.
    pub fn handle_event(self: &Arc<Self>) {
        let revents = self.revents.load(Ordering::Relaxed);
        let mut handlers = self.handlers.lock();

        if revents & REV_CLOSED != 0 && revents & REV_READABLE == 0 {
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }
        if revents & REV_ERROR != 0 {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }
        if revents & REV_READABLE != 0 {
            if let Some(cb) = handlers.read.as_mut() {
                cb();
            }
        }
        if revents & REV_WRITABLE != 0 {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("state", &self.poller_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_mask_transitions() {
        // A detached weak owner keeps update() inert so the mask logic can
        // be exercised in isolation.
        let ch = Channel::from_weak(Weak::new(), 7);
        assert!(ch.is_none_interest());

        ch.enable_reading();
        assert!(ch.is_reading());
        assert!(!ch.is_writing());

        ch.enable_writing();
        assert!(ch.is_reading());
        assert!(ch.is_writing());

        ch.disable_writing();
        assert!(!ch.is_writing());

        ch.disable_all();
        assert!(ch.is_none_interest());
    }

    #[test]
    fn test_dispatch_order_close_beats_read_on_pure_hangup() {
        let ch = Channel::from_weak(Weak::new(), 3);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        ch.set_close_callback(move || o.lock().push("close"));
        let o = order.clone();
        ch.set_read_callback(move || o.lock().push("read"));

        ch.set_revents(REV_CLOSED);
        ch.handle_event();
        assert_eq!(*order.lock(), vec!["close"]);

        order.lock().clear();
        ch.set_revents(REV_CLOSED | REV_READABLE);
        ch.handle_event();
        // Data pending: drain first, the close arrives via read-of-zero.
        assert_eq!(*order.lock(), vec!["read"]);
    }

    #[test]
    fn test_dispatch_read_then_write() {
        let ch = Channel::from_weak(Weak::new(), 3);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        ch.set_read_callback(move || o.lock().push("read"));
        let o = order.clone();
        ch.set_write_callback(move || o.lock().push("write"));

        ch.set_revents(REV_READABLE | REV_WRITABLE);
        ch.handle_event();
        assert_eq!(*order.lock(), vec!["read", "write"]);
    }
}
