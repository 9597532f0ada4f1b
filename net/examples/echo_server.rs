use std::sync::Arc;

use rivet_net::{EventLoop, PortOption, TcpServer};
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let threads: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let lp = EventLoop::new().expect("event loop setup failed");
    let server = TcpServer::new(
        &lp,
        &bind_addr.parse().expect("invalid bind address"),
        "echo",
        PortOption::NoReusePort,
    )
    .expect("failed to bind");

    server.set_thread_num(threads);
    server.set_connection_callback(Arc::new(|conn| {
        info!(
            name = conn.name(),
            peer = %conn.peer_addr(),
            up = conn.connected(),
            "connection"
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf| {
        let data = buf.split().freeze();
        conn.send(&data);
    }));

    info!(addr = server.ip_port(), threads, "echo server running");
    server.start().expect("failed to start server");
    lp.run();
}
