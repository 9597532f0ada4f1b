//! Callback aliases shared by connections and servers.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::debug;

use crate::tcp_connection::TcpConnection;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired on establish and on disconnect; inspect
/// [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Fired with the connection's input buffer whenever bytes arrive. The
/// callback consumes whatever complete frames it finds; leftovers stay in
/// the buffer for the next read.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut BytesMut) + Send + Sync>;

/// Fired once the output buffer fully drains after a buffered write.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Installed when the user supplies no connection callback.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    debug!(
        name = conn.name(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection state changed"
    );
}

/// Installed when the user supplies no message callback: discard.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut BytesMut) {
    buf.clear();
}
