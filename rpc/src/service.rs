//! The capability interface the dispatcher requires from a service.
//!
//! The schema runtime (generated code or a hand-rolled shim) supplies an
//! implementation per service; the dispatcher never sees concrete request
//! or response types, only their serialized forms.

use bytes::Bytes;

/// Why a request could not be handed to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The service has no method by that name.
    NoMethod,
    /// The request bytes failed to parse as the method's request type.
    InvalidRequest,
}

/// Completion handed to a dispatched method; invoke it once with the
/// serialized response. May be called after `dispatch` returns.
pub type ResponseDone = Box<dyn FnOnce(Bytes) + Send>;

pub trait Service: Send + Sync {
    /// Fully qualified service name requests are routed by.
    fn full_name(&self) -> &str;

    /// Decode `request`, run `method`, and eventually complete `done` with
    /// the serialized response.
    fn dispatch(
        &self,
        method: &str,
        request: &[u8],
        done: ResponseDone,
    ) -> Result<(), DispatchError>;
}
