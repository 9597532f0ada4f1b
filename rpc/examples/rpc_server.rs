//! Demo RPC server exposing a single greeter-style service.
//!
//! The request and response bodies are plain UTF-8 here; a real deployment
//! plugs its schema runtime in behind the `Service` trait.

use std::sync::Arc;

use bytes::Bytes;
use rivet_net::EventLoop;
use rivet_rpc::{DispatchError, ResponseDone, RpcServer, Service};
use tracing::info;

struct MonitorService;

impl Service for MonitorService {
    fn full_name(&self) -> &str {
        "demo.Monitor"
    }

    fn dispatch(
        &self,
        method: &str,
        request: &[u8],
        done: ResponseDone,
    ) -> Result<(), DispatchError> {
        match method {
            "Info" => {
                let count = std::str::from_utf8(request)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or(DispatchError::InvalidRequest)?;
                info!(count, "info request");
                done(Bytes::from(format!("high_{count}")));
                Ok(())
            }
            _ => Err(DispatchError::NoMethod),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9981".to_string());
    let threads: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let lp = EventLoop::new().expect("event loop setup failed");
    let server = RpcServer::new(&lp, &bind_addr.parse().expect("invalid bind address"))
        .expect("failed to bind");
    server.set_thread_num(threads);
    server.register_service(Arc::new(MonitorService));
    server.start().expect("failed to start server");

    info!(
        addr = %server.local_addr().expect("no local address"),
        threads,
        "rpc server running"
    );
    lp.run();
}
