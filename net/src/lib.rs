//! Multi-reactor TCP server core.
//!
//! One [`EventLoop`] per thread multiplexes readiness with epoll and drains
//! a cross-thread task queue; an [`Acceptor`] on the base loop feeds new
//! connections to an [`EventLoopThreadPool`] of worker loops; each
//! [`TcpConnection`] is driven entirely on its owning loop. See the
//! `echo_server` example for the minimal wiring.

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod metrics;
pub mod poller;
pub mod socket;
pub mod tcp_connection;
pub mod tcp_server;

// Public API re-exports
pub use acceptor::Acceptor;
pub use callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
pub use channel::Channel;
pub use error::Error;
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use socket::Socket;
pub use tcp_connection::{ConnState, TcpConnection};
pub use tcp_server::{PortOption, TcpServer};
