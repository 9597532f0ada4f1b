//! Schema-framed RPC over `rivet-net`.
//!
//! Frames are size-prefixed, tagged, and Adler-32 checksummed; the payload
//! is an [`RpcMessage`] envelope correlating concurrent calls by id over a
//! single TCP stream. [`RpcServer`] routes inbound requests to registered
//! [`Service`] implementations; [`RpcChannel`] issues calls from either
//! side of a connection.

pub mod channel;
pub mod codec;
pub mod message;
pub mod metrics;
pub mod service;
pub mod server;
pub mod wire;

// Public API re-exports
pub use channel::{RpcChannel, RpcDone, RpcResult, ServiceMap};
pub use codec::{CodecError, RpcCodec, MAX_FRAME_LEN};
pub use message::{ErrorCode, MessageKind, RpcMessage};
pub use server::RpcServer;
pub use service::{DispatchError, ResponseDone, Service};
