//! One-thread reactor.
//!
//! An [`EventLoop`] is owned by exactly one OS thread. Each iteration of
//! [`EventLoop::run`] blocks in the poller (10 s cap), dispatches every
//! ready channel, then drains the cross-thread task queue. The queue is the
//! only sanctioned way to touch a loop's state from another thread; an
//! eventfd wakes a blocked poll whenever a task is enqueued off-thread or
//! while the drain itself is running, so nothing waits out a full poll
//! timeout.
//!
//! Thread affinity is enforced hard: channel mutation from a foreign thread
//! panics, and a thread can host at most one loop at a time.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::metrics::{LOOP_TASKS_EXECUTED, LOOP_WAKEUPS};
use crate::poller::Poller;

/// A deferred unit of work executed on the loop's thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long one poll may block when nothing is ready.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

pub struct EventLoop {
    poller: Mutex<Poller>,
    pending: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    thread_id: ThreadId,
    wakeup_fd: RawFd,
    wakeup_channel: Arc<Channel>,
}

impl EventLoop {
    /// Create the loop for the calling thread. Panics if this thread
    /// already hosts one.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        CURRENT_LOOP.with(|slot| {
            if slot.borrow().strong_count() > 0 {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let poller = Poller::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let lp = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            poller: Mutex::new(poller),
            pending: Mutex::new(Vec::new()),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            thread_id: thread::current().id(),
            wakeup_fd,
            wakeup_channel: Channel::from_weak(weak.clone(), wakeup_fd),
        });

        let fd = wakeup_fd;
        lp.wakeup_channel.set_read_callback(move || {
            let mut one: u64 = 0;
            let n = unsafe { libc::read(fd, &mut one as *mut u64 as *mut libc::c_void, 8) };
            if n != 8 {
                error!(bytes = n, "wakeup read came up short");
            }
        });
        lp.wakeup_channel.enable_reading();

        CURRENT_LOOP.with(|slot| *slot.borrow_mut() = Arc::downgrade(&lp));
        debug!(thread = ?lp.thread_id, "event loop created");
        Ok(lp)
    }

    /// The loop hosted by the calling thread, if any.
    pub fn current() -> Option<Arc<EventLoop>> {
        CURRENT_LOOP.with(|slot| slot.borrow().upgrade())
    }

    /// Run the reactor until [`EventLoop::quit`]. Must be called on the
    /// owning thread, and only once at a time.
    pub fn run(self: &Arc<Self>) {
        assert!(
            !self.looping.swap(true, Ordering::AcqRel),
            "event loop is already running"
        );
        self.assert_in_loop_thread();
        self.quit.store(false, Ordering::Release);
        debug!("event loop starting");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            {
                let mut poller = self.poller.lock();
                poller.poll(POLL_TIMEOUT, &mut active);
            }
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::Release);
            for channel in &active {
                channel.handle_event();
            }
            self.event_handling.store(false, Ordering::Release);

            self.run_pending_tasks();
        }

        debug!("event loop stopped");
        self.looping.store(false, Ordering::Release);
    }

    /// Ask the loop to exit after the current iteration. Safe from any
    /// thread; cross-thread calls wake a blocked poll.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` now if called on the owning thread, otherwise enqueue it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueue `task` for the next drain. Wakes the loop when the caller is
    /// off-thread or the drain is already in progress, so the task cannot
    /// wait out a full poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            self.pending.lock().push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.pending.lock().len()
    }

    /// Completed poll iterations since the loop started.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "event loop owned by thread {:?} was accessed from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(
            std::ptr::eq(channel.owner_ptr(), self),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(
            std::ptr::eq(channel.owner_ptr(), self),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        assert!(
            std::ptr::eq(channel.owner_ptr(), self),
            "channel belongs to a different loop"
        );
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8) };
        if n != 8 {
            error!(bytes = n, "wakeup write came up short");
        }
        LOOP_WAKEUPS.increment();
    }

    /// Swap the queue out under the lock and execute outside it, so tasks
    /// can enqueue more work without deadlocking. Work appended mid-drain is
    /// observed on the next drain (the enqueue wakes the poll).
    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        let count = tasks.len();
        for task in tasks {
            task();
        }
        if count > 0 {
            LOOP_TASKS_EXECUTED.add(count as u64);
            trace!(count, "drained pending tasks");
        }
        self.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The weak back-reference is already dead here, so tear the wakeup
        // channel down against the poller directly.
        self.wakeup_channel.clear_interest();
        self.poller.get_mut().remove_channel(&self.wakeup_channel);
        unsafe {
            libc::close(self.wakeup_fd);
        }
        CURRENT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            if std::ptr::eq(Weak::as_ptr(&*slot), self as *const EventLoop) {
                *slot = Weak::new();
            }
        });
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.thread_id)
            .field("iteration", &self.iteration())
            .finish()
    }
}
