//! TCP server: an acceptor on the base loop plus a worker-loop pool.
//!
//! Accepted connections are named `${server}#${id}`, assigned a worker loop
//! round-robin, tracked in a map owned by the base loop's thread, and
//! established/destroyed on their worker loop. The user configures
//! callbacks and thread count before `start()`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::socket::Socket;
use crate::tcp_connection::TcpConnection;

/// Whether the listening socket opts into SO_REUSEPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOption {
    NoReusePort,
    ReusePort,
}

struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

pub struct TcpServer {
    lp: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    callbacks: Mutex<UserCallbacks>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    // Touched only on the base loop's thread.
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    pub fn new(
        lp: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        name: impl Into<String>,
        option: PortOption,
    ) -> Result<Arc<TcpServer>, Error> {
        let name = name.into();
        let acceptor = Acceptor::new(lp, listen_addr, option == PortOption::ReusePort)?;
        let ip_port = acceptor
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| listen_addr.to_string());

        let server = Arc::new(TcpServer {
            lp: Arc::clone(lp),
            ip_port,
            pool: Arc::new(EventLoopThreadPool::new(Arc::clone(lp), name.clone())),
            name,
            acceptor,
            callbacks: Mutex::new(UserCallbacks {
                connection: None,
                message: None,
                write_complete: None,
                thread_init: None,
            }),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |sock, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(sock, peer);
                }
            }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `ip:port` actually bound (resolves port 0).
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn base_loop(&self) -> Arc<EventLoop> {
        Arc::clone(&self.lp)
    }

    pub fn thread_pool(&self) -> Arc<EventLoopThreadPool> {
        Arc::clone(&self.pool)
    }

    /// Worker loop count. 0 keeps all I/O on the base loop. Must be called
    /// before `start()`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.callbacks.lock().thread_init = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    /// Start the pool and begin listening. Harmless to call twice.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.name, addr = %self.ip_port, "server starting");

        let thread_init = self.callbacks.lock().thread_init.clone();
        self.pool.start(thread_init)?;

        let acceptor = Arc::clone(&self.acceptor);
        assert!(!acceptor.listening());
        self.lp.run_in_loop(move || acceptor.listen());
        Ok(())
    }

    /// Runs on the base loop for every accepted socket.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        self.lp.assert_in_loop_thread();

        let io_loop = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}#{}", self.name, id);

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "dropping connection without a local address");
                return;
            }
        };
        debug!(name = %conn_name, peer = %peer_addr, "new connection");
        CONNECTIONS_ACCEPTED.increment();

        let conn = TcpConnection::new(&io_loop, conn_name.clone(), socket, local_addr, peer_addr);
        {
            let callbacks = self.callbacks.lock();
            if let Some(cb) = callbacks.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(c);
            }
        }));

        self.connections.lock().insert(conn_name, Arc::clone(&conn));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Thread safe: hops to the base loop for the map removal, then defers
    /// destruction onto the connection's worker loop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.lp
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        self.lp.assert_in_loop_thread();
        debug!(name = conn.name(), "removing connection");

        let removed = self.connections.lock().remove(conn.name());
        debug_assert!(removed.is_some(), "connection missing from map");

        let io_loop = conn.owner_loop();
        let conn = Arc::clone(conn);
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }

    /// Connections currently tracked. Base-loop thread only.
    pub fn connection_count(&self) -> usize {
        self.lp.assert_in_loop_thread();
        self.connections.lock().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionPtr> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            let c = Arc::clone(&conn);
            conn.owner_loop().run_in_loop(move || c.connect_destroyed());
        }
    }
}
