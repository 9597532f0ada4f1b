//! Per-connection state machine.
//!
//! A [`TcpConnection`] wraps an accepted fd and lives on exactly one worker
//! loop: Connecting until established, Connected while traffic flows,
//! Disconnecting once a half-close is requested with output still buffered,
//! Disconnected after the channel is torn down. The struct is shared as
//! `Arc` (the server map and in-flight callbacks hold it) but every state
//! transition happens on the owning loop's thread; the internal mutex is
//! uncontended and exists to make that sharing sound.
//!
//! Channel callbacks hold only a `Weak` back-reference and upgrade on
//! entry, so a connection destroyed while an event was in flight is
//! observed as absent rather than dangling.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::{read_fd, write_fd};
use crate::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

struct Buffers {
    input: BytesMut,
    output: BytesMut,
}

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    lp: Arc<EventLoop>,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    buffers: Mutex<Buffers>,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    pub fn new(
        lp: &Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        if let Err(e) = socket.set_keep_alive(true) {
            warn!(name = %name, error = %e, "SO_KEEPALIVE failed");
        }
        let channel = Channel::new(lp, socket.fd());
        Arc::new(TcpConnection {
            lp: Arc::clone(lp),
            name,
            socket,
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            buffers: Mutex::new(Buffers {
                input: BytesMut::with_capacity(4096),
                output: BytesMut::new(),
            }),
            callbacks: Mutex::new(Callbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                close: None,
            }),
            context: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> Arc<EventLoop> {
        Arc::clone(&self.lp)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_no_delay(on) {
            warn!(name = %self.name, error = %e, "TCP_NODELAY failed");
        }
    }

    /// Kernel TCP diagnostics for this connection.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        self.socket.tcp_info_string()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    /// Attach an application object to ride this connection (a protocol
    /// session, for instance).
    pub fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        *self.context.lock() = Some(ctx);
    }

    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context.lock().clone()
    }

    pub fn clear_context(&self) {
        *self.context.lock() = None;
    }

    /// Send bytes on this connection from any thread. Off-loop callers pay
    /// one copy; ordering follows the enqueue order onto the owning loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.lp.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = Arc::clone(self);
            let owned = data.to_vec();
            self.lp.queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.lp.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, giving up on write");
            return;
        }

        let len = data.len();
        let mut nwrote = 0;
        let mut fault = false;
        let mut write_complete = false;

        {
            let mut buffers = self.buffers.lock();
            // Direct write only when nothing is queued, to keep byte order.
            if !self.channel.is_writing() && buffers.output.is_empty() {
                match write_fd(self.channel.fd(), data) {
                    Ok(n) => {
                        nwrote = n;
                        if n == len {
                            write_complete = true;
                        }
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!(name = %self.name, error = %e, "write failed");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }

            if !fault && nwrote < len {
                buffers.output.extend_from_slice(&data[nwrote..]);
                if !self.channel.is_writing() {
                    self.channel.enable_writing();
                }
            }
        }

        if write_complete {
            self.queue_write_complete();
        }
    }

    /// Half-close the write side once buffered output drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = Arc::clone(self);
            self.lp.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.lp.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, error = %e, "shutdown failed");
            }
        }
        // Still writing: handle_write performs the half-close on drain.
    }

    /// Close without waiting for output to drain.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.set_state(ConnState::Disconnecting);
            let conn = Arc::clone(self);
            self.lp.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();
        let state = self.state();
        if state == ConnState::Connected || state == ConnState::Disconnecting {
            self.handle_close();
        }
    }

    /// Wire the channel callbacks and start reading. Called exactly once,
    /// on the owning loop, by the server that built this connection.
    pub fn connect_established(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let weak = Arc::downgrade(self);
        self.channel.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        });
        let weak = Arc::downgrade(self);
        self.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(self);
        self.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(self);
        self.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        self.channel.enable_reading();
        CONNECTIONS_ACTIVE.increment();

        let cb = self.callbacks.lock().connection.clone();
        cb(self);
    }

    /// Final teardown, queued onto the owning loop after the server has
    /// dropped its map entry.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            // Closed without going through handle_close (server teardown).
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            CONNECTIONS_ACTIVE.decrement();
            let cb = self.callbacks.lock().connection.clone();
            cb(self);
        }
        self.channel.remove();
        self.clear_context();
    }

    fn handle_read(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();

        // Readiness is edge-triggered: drain the socket completely before
        // surfacing anything, or the edge is lost.
        let mut saw_eof = false;
        let mut fatal = false;
        let mut total = 0;
        loop {
            let read = {
                let mut buffers = self.buffers.lock();
                read_fd(&mut buffers.input, self.channel.fd())
            };
            match read {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(name = %self.name, error = %e, "read failed");
                    fatal = true;
                    break;
                }
            }
        }

        if total > 0 {
            trace!(name = %self.name, bytes = total, "read");
            // The buffer leaves the lock for the callback so user code can
            // call back into send()/shutdown() freely.
            let mut input = std::mem::take(&mut self.buffers.lock().input);
            let cb = self.callbacks.lock().message.clone();
            cb(self, &mut input);
            self.buffers.lock().input = input;
        }

        if saw_eof {
            self.handle_close();
        } else if fatal {
            self.handle_error();
            self.handle_close();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "write readiness after disable, ignoring");
            return;
        }

        let mut drained = false;
        let mut fatal = false;
        {
            let mut buffers = self.buffers.lock();
            match write_fd(self.channel.fd(), &buffers.output) {
                Ok(n) => {
                    buffers.output.advance(n);
                    if buffers.output.is_empty() {
                        self.channel.disable_writing();
                        drained = true;
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(name = %self.name, error = %e, "write failed");
                    fatal = true;
                }
            }
        }

        if fatal {
            self.handle_error();
            self.handle_close();
            return;
        }
        if drained {
            self.queue_write_complete();
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.lp.assert_in_loop_thread();
        let state = self.state();
        if state != ConnState::Connected && state != ConnState::Disconnecting {
            return;
        }
        debug!(name = %self.name, ?state, "closing");

        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();
        CONNECTIONS_ACTIVE.decrement();

        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        connection_cb(self);
        // Hands the connection back to its server for map removal and
        // deferred destruction.
        if let Some(close_cb) = close_cb {
            close_cb(self);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(e)) => e,
            Ok(None) => return,
            Err(e) => e,
        };
        error!(name = %self.name, error = %err, "connection error");
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.lock().write_complete.clone();
        if let Some(cb) = cb {
            let conn = Arc::clone(self);
            self.lp.queue_in_loop(move || cb(&conn));
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.channel.fd())
            .field("state", &self.state())
            .finish()
    }
}
