//! Call multiplexing over one connection.
//!
//! An [`RpcChannel`] rides a single [`TcpConnection`](rivet_net::TcpConnection)
//! and plays both sides: outbound calls get a fresh id and wait in the
//! outstanding table until the matching response arrives; inbound requests
//! are routed through the registered service map and answered with the
//! original id. Calls may be issued from any thread; the codec forwards
//! writes onto the connection's owning loop, and the outstanding table's
//! mutex is held only for map operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use rivet_net::TcpConnectionPtr;

use crate::codec::{self, RpcCodec};
use crate::message::{ErrorCode, MessageKind, RpcMessage};
use crate::metrics::{
    CALLS_SENT, DISPATCH_FAILURES, ORPHAN_RESPONSES, REQUESTS_DISPATCHED, RESPONSES_MATCHED,
};
use crate::service::{DispatchError, ResponseDone, Service};

/// Services routable on a channel, keyed by fully qualified name.
pub type ServiceMap = HashMap<String, Arc<dyn Service>>;

/// What a caller's continuation receives: the response body (possibly
/// empty), or the dispatch error the peer reported.
pub type RpcResult = Result<Bytes, ErrorCode>;

/// Continuation fired exactly once when the matching response arrives.
/// Never fired on teardown; watch the connection for that.
pub type RpcDone = Box<dyn FnOnce(RpcResult) + Send>;

struct OutstandingCall {
    done: RpcDone,
}

pub struct RpcChannel {
    codec: RpcCodec,
    conn: TcpConnectionPtr,
    services: Mutex<Option<Arc<ServiceMap>>>,
    outstanding: Mutex<HashMap<i64, OutstandingCall>>,
    next_id: AtomicI64,
}

impl RpcChannel {
    pub fn new(conn: TcpConnectionPtr) -> Arc<RpcChannel> {
        Arc::new_cyclic(|weak: &Weak<RpcChannel>| {
            let weak = weak.clone();
            RpcChannel {
                codec: RpcCodec::new(Arc::new(move |conn, message| {
                    if let Some(channel) = weak.upgrade() {
                        channel.on_rpc_message(conn, message);
                    }
                })),
                conn,
                services: Mutex::new(None),
                outstanding: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(0),
            }
        })
    }

    pub fn connection(&self) -> &TcpConnectionPtr {
        &self.conn
    }

    /// Install the services this channel dispatches inbound requests to.
    pub fn set_services(&self, services: Arc<ServiceMap>) {
        *self.services.lock() = Some(services);
    }

    /// Issue a call. Safe from any thread; returns the allocated id.
    ///
    /// `done` fires once with the peer's response or error. On connection
    /// loss it never fires; the entry is reclaimed by [`RpcChannel::teardown`].
    pub fn call(&self, service: &str, method: &str, request: &[u8], done: RpcDone) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let message = RpcMessage::request(id, service, method, Bytes::copy_from_slice(request));

        self.outstanding.lock().insert(id, OutstandingCall { done });
        CALLS_SENT.increment();
        self.codec.send(&self.conn, &message);
        id
    }

    /// Feed bytes from the connection's input buffer through the codec.
    pub fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut BytesMut) {
        self.codec.on_message(conn, buf);
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Reclaim every outstanding entry without firing continuations.
    pub fn teardown(&self) {
        let dropped = {
            let mut outstanding = self.outstanding.lock();
            let n = outstanding.len();
            outstanding.clear();
            n
        };
        if dropped > 0 {
            debug!(conn = self.conn.name(), dropped, "outstanding calls reclaimed");
        }
    }

    fn on_rpc_message(&self, conn: &TcpConnectionPtr, message: RpcMessage) {
        debug_assert!(Arc::ptr_eq(conn, &self.conn));
        match message.kind {
            MessageKind::Request => self.handle_request(message),
            MessageKind::Response | MessageKind::Error => self.handle_response(message),
        }
    }

    fn handle_request(&self, message: RpcMessage) {
        let id = message.id;
        if message.service.is_empty() || message.method.is_empty() {
            self.reply_error(id, ErrorCode::WrongProto);
            return;
        }

        let services = self.services.lock().clone();
        let service = match services.as_ref().and_then(|map| map.get(&message.service)) {
            Some(service) => Arc::clone(service),
            None => {
                self.reply_error(id, ErrorCode::NoService);
                return;
            }
        };

        // The completion may outlive this frame; it carries only what it
        // needs to push the response back out.
        let conn = Arc::clone(&self.conn);
        let done: ResponseDone = Box::new(move |response: Bytes| {
            let reply = RpcMessage::response(id, response);
            match codec::encode(&reply) {
                Ok(frame) => conn.send(&frame),
                Err(e) => warn!(id, error = %e, "response dropped"),
            }
        });

        match service.dispatch(&message.method, &message.request, done) {
            Ok(()) => {
                REQUESTS_DISPATCHED.increment();
            }
            Err(DispatchError::NoMethod) => self.reply_error(id, ErrorCode::NoMethod),
            Err(DispatchError::InvalidRequest) => self.reply_error(id, ErrorCode::InvalidRequest),
        }
    }

    fn reply_error(&self, id: i64, error: ErrorCode) {
        DISPATCH_FAILURES.increment();
        warn!(id, code = ?error, "request failed to dispatch");
        self.codec.send(&self.conn, &RpcMessage::error(id, error));
    }

    fn handle_response(&self, message: RpcMessage) {
        let id = message.id;
        let call = self.outstanding.lock().remove(&id);
        match call {
            Some(call) => {
                RESPONSES_MATCHED.increment();
                let result = if message.kind == MessageKind::Error
                    && message.error != ErrorCode::NoError
                {
                    Err(message.error)
                } else {
                    Ok(message.response)
                };
                (call.done)(result);
            }
            None => {
                ORPHAN_RESPONSES.increment();
                warn!(id, "response with unknown id dropped");
            }
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("conn", &self.conn.name())
            .field("outstanding", &self.outstanding_count())
            .finish()
    }
}
