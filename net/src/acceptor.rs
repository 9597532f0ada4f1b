//! Listening-socket owner.
//!
//! On readable the acceptor drains the kernel accept queue until
//! `WouldBlock`, handing each `(Socket, peer)` to its callback. A reserved
//! idle fd lets it shed pending connections when the process hits its
//! descriptor limit; without that, connections the queue can never deliver
//! would sit there holding the listener ready forever.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::ACCEPT_EMFILE_RECOVERIES;
use crate::socket::Socket;

/// Delivered one per accepted connection, on the acceptor's loop thread.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

const LISTEN_BACKLOG: i32 = 1024;

pub struct Acceptor {
    lp: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    idle_fd: AtomicI32,
    listening: AtomicBool,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
}

fn open_idle_fd() -> io::Result<i32> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

impl Acceptor {
    pub fn new(
        lp: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_stream(listen_addr)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port);
        socket.bind(listen_addr)?;

        let idle_fd = open_idle_fd()?;
        let channel = Channel::new(lp, socket.fd());

        let acceptor = Arc::new(Acceptor {
            lp: Arc::clone(lp),
            socket,
            channel,
            idle_fd: AtomicI32::new(idle_fd),
            listening: AtomicBool::new(false),
            on_new_connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_new_connection.lock() = Some(cb);
    }

    /// Address the socket actually bound to (resolves port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Start listening and arm the read channel. In-loop only.
    pub fn listen(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen(LISTEN_BACKLOG) {
            panic!("listen failed on fd {}: {e}", self.socket.fd());
        }
        info!(fd = self.socket.fd(), "listening");
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        self.lp.assert_in_loop_thread();

        loop {
            match self.socket.accept() {
                Ok((sock, peer)) => {
                    let mut cb = self.on_new_connection.lock();
                    match cb.as_mut() {
                        Some(cb) => cb(sock, peer),
                        // No consumer: drop closes the fd.
                        None => warn!(%peer, "accepted connection with no callback"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    if !self.shed_one_connection() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Out of descriptors: give the idle fd back, accept-and-close one
    /// pending connection to clear the kernel queue, then re-reserve.
    /// Returns whether a pending connection was actually shed.
    fn shed_one_connection(&self) -> bool {
        warn!("fd limit reached, shedding one pending connection");
        ACCEPT_EMFILE_RECOVERIES.increment();

        let idle = self.idle_fd.swap(-1, Ordering::Relaxed);
        if idle < 0 {
            // No reserve fd to give back; nothing can be shed.
            return false;
        }
        let shed = unsafe {
            libc::close(idle);
            let conn = libc::accept(self.socket.fd(), std::ptr::null_mut(), std::ptr::null_mut());
            if conn >= 0 {
                libc::close(conn);
                true
            } else {
                false
            }
        };
        match open_idle_fd() {
            Ok(fd) => self.idle_fd.store(fd, Ordering::Relaxed),
            Err(e) => error!(error = %e, "failed to re-reserve idle fd"),
        }
        shed
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.clear_interest();
        // The channel was only registered if listen() ran.
        if self.listening() {
            self.lp.remove_channel(&self.channel);
        }
        let idle = self.idle_fd.load(Ordering::Relaxed);
        if idle >= 0 {
            unsafe {
                libc::close(idle);
            }
        }
    }
}
