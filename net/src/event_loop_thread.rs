//! Loop-hosting threads and the worker pool.
//!
//! An [`EventLoopThread`] spawns a named thread, builds an [`EventLoop`] on
//! it, runs the optional init hook, publishes the loop handle back to the
//! spawner, then parks in `run()`. [`EventLoopThreadPool`] owns N of them
//! and hands loops out round-robin or by hash for session affinity.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Hook invoked on a worker's own thread with its freshly built loop,
/// before the loop starts running.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    lp: Option<Arc<EventLoop>>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            lp: None,
            handle: None,
        }
    }

    /// Spawn the thread and block until it has published its loop handle.
    pub fn start_loop(&mut self) -> Result<Arc<EventLoop>, Error> {
        assert!(self.handle.is_none(), "loop thread started twice");

        let (tx, rx) = crossbeam_channel::bounded(1);
        let init = self.init.take();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&lp);
                }
                let _ = tx.send(Ok(Arc::clone(&lp)));
                lp.run();
            })
            .map_err(Error::Io)?;
        self.handle = Some(handle);

        let lp = rx.recv().map_err(|_| Error::WorkerStartup)??;
        self.lp = Some(Arc::clone(&lp));
        Ok(lp)
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(lp) = self.lp.take() {
            lp.quit();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "loop thread panicked");
            }
        }
    }
}

pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads; 0 keeps all I/O on the base loop. Must be
    /// set before [`EventLoopThreadPool::start`].
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started(), "thread count changed after start");
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    /// Spawn the workers and wait for each to publish its loop. With zero
    /// workers the init hook runs on the base loop instead.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "thread pool started twice"
        );
        self.base_loop.assert_in_loop_thread();

        let num_threads = self.num_threads.load(Ordering::Relaxed);
        debug!(name = %self.name, workers = num_threads, "starting loop pool");

        let mut threads = self.threads.lock();
        let mut loops = self.loops.lock();
        for i in 0..num_threads {
            let mut t = EventLoopThread::new(format!("{}-io-{}", self.name, i), init.clone());
            let lp = t.start_loop()?;
            threads.push(t);
            loops.push(lp);
        }

        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Next loop in round-robin order; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started(), "pool not started");

        let loops = self.loops.lock();
        if loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        Arc::clone(&loops[index])
    }

    /// Stable loop for a caller-supplied hash, giving session affinity.
    pub fn get_loop_for_hash(&self, hash: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started(), "pool not started");

        let loops = self.loops.lock();
        if loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        Arc::clone(&loops[hash % loops.len()])
    }

    /// Every loop in the pool; just the base loop when the pool is empty.
    /// Live once [`EventLoopThreadPool::start`] has returned.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started(), "pool not started");

        let loops = self.loops.lock();
        if loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
