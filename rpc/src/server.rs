//! RPC server glue: a [`TcpServer`] whose connections each carry an
//! [`RpcChannel`] in their context slot.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use rivet_net::{Error, EventLoop, PortOption, TcpServer};

use crate::channel::{RpcChannel, ServiceMap};
use crate::service::Service;

pub struct RpcServer {
    server: Arc<TcpServer>,
    services: Mutex<ServiceMap>,
}

impl RpcServer {
    pub fn new(lp: &Arc<EventLoop>, listen_addr: &SocketAddr) -> Result<RpcServer, Error> {
        let server = TcpServer::new(lp, listen_addr, "rpc", PortOption::NoReusePort)?;
        Ok(RpcServer {
            server,
            services: Mutex::new(HashMap::new()),
        })
    }

    /// Worker loop count; see [`TcpServer::set_thread_num`].
    pub fn set_thread_num(&self, num_threads: usize) {
        self.server.set_thread_num(num_threads);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn tcp_server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    /// Register a service by its fully qualified name. Call before `start`.
    pub fn register_service(&self, service: Arc<dyn Service>) {
        let name = service.full_name().to_string();
        info!(service = %name, "service registered");
        self.services.lock().insert(name, service);
    }

    pub fn start(&self) -> Result<(), Error> {
        let services: Arc<ServiceMap> = Arc::new(self.services.lock().clone());

        self.server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                debug!(conn = conn.name(), "rpc channel attached");
                let channel = RpcChannel::new(Arc::clone(conn));
                channel.set_services(Arc::clone(&services));
                conn.set_context(channel);
            } else {
                if let Some(ctx) = conn.context() {
                    if let Some(channel) = ctx.downcast_ref::<RpcChannel>() {
                        channel.teardown();
                    }
                }
                conn.clear_context();
            }
        }));

        self.server.set_message_callback(Arc::new(|conn, buf| {
            if let Some(ctx) = conn.context() {
                if let Some(channel) = ctx.downcast_ref::<RpcChannel>() {
                    channel.on_message(conn, buf);
                }
            }
        }));

        self.server.start()
    }
}
