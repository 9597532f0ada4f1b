//! The RPC envelope carried in every frame payload.

use bytes::Bytes;

use crate::wire;

/// What an envelope is doing on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    Error = 3,
}

impl MessageKind {
    pub fn from_u64(value: u64) -> Option<MessageKind> {
        match value {
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            3 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Dispatch failure reported back to the caller with the original id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0,
    WrongProto = 1,
    NoService = 2,
    NoMethod = 3,
    InvalidRequest = 4,
}

impl ErrorCode {
    pub fn from_u64(value: u64) -> Option<ErrorCode> {
        match value {
            0 => Some(ErrorCode::NoError),
            1 => Some(ErrorCode::WrongProto),
            2 => Some(ErrorCode::NoService),
            3 => Some(ErrorCode::NoMethod),
            4 => Some(ErrorCode::InvalidRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message kind: {0}")]
    UnknownKind(u64),
    #[error("malformed envelope")]
    Malformed,
}

/// Field numbers, in declaration order: kind=1, id=2, service=3, method=4,
/// request=5, response=6, error=7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub kind: MessageKind,
    /// Strictly positive, per-channel, strictly increasing.
    pub id: i64,
    pub service: String,
    pub method: String,
    pub request: Bytes,
    pub response: Bytes,
    pub error: ErrorCode,
}

impl RpcMessage {
    pub fn request(id: i64, service: &str, method: &str, request: Bytes) -> RpcMessage {
        RpcMessage {
            kind: MessageKind::Request,
            id,
            service: service.to_string(),
            method: method.to_string(),
            request,
            response: Bytes::new(),
            error: ErrorCode::NoError,
        }
    }

    pub fn response(id: i64, response: Bytes) -> RpcMessage {
        RpcMessage {
            kind: MessageKind::Response,
            id,
            service: String::new(),
            method: String::new(),
            request: Bytes::new(),
            response,
            error: ErrorCode::NoError,
        }
    }

    pub fn error(id: i64, error: ErrorCode) -> RpcMessage {
        RpcMessage {
            kind: MessageKind::Error,
            id,
            service: String::new(),
            method: String::new(),
            request: Bytes::new(),
            response: Bytes::new(),
            error,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            32 + self.service.len() + self.method.len() + self.request.len() + self.response.len(),
        );
        wire::encode_uint64(1, self.kind as u64, &mut buf);
        wire::encode_uint64(2, self.id as u64, &mut buf);
        if !self.service.is_empty() {
            wire::encode_string(3, &self.service, &mut buf);
        }
        if !self.method.is_empty() {
            wire::encode_string(4, &self.method, &mut buf);
        }
        if !self.request.is_empty() {
            wire::encode_bytes(5, &self.request, &mut buf);
        }
        if !self.response.is_empty() {
            wire::encode_bytes(6, &self.response, &mut buf);
        }
        if self.error != ErrorCode::NoError {
            wire::encode_uint64(7, self.error as u64, &mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<RpcMessage, DecodeError> {
        let mut buf = data;
        let mut kind = None;
        let mut id: i64 = 0;
        let mut service = String::new();
        let mut method = String::new();
        let mut request = Bytes::new();
        let mut response = Bytes::new();
        let mut error = ErrorCode::NoError;

        while !buf.is_empty() {
            let (field, wire_type) =
                wire::decode_tag(&mut buf).ok_or(DecodeError::Malformed)?;
            match field {
                1 => {
                    let value =
                        wire::decode_varint(&mut buf).ok_or(DecodeError::Malformed)?;
                    kind = Some(MessageKind::from_u64(value)
                        .ok_or(DecodeError::UnknownKind(value))?);
                }
                2 => {
                    id = wire::decode_varint(&mut buf).ok_or(DecodeError::Malformed)? as i64;
                }
                3 => {
                    let raw = wire::decode_length_delimited(&mut buf)
                        .ok_or(DecodeError::Malformed)?;
                    service = std::str::from_utf8(raw)
                        .map_err(|_| DecodeError::Malformed)?
                        .to_string();
                }
                4 => {
                    let raw = wire::decode_length_delimited(&mut buf)
                        .ok_or(DecodeError::Malformed)?;
                    method = std::str::from_utf8(raw)
                        .map_err(|_| DecodeError::Malformed)?
                        .to_string();
                }
                5 => {
                    let raw = wire::decode_length_delimited(&mut buf)
                        .ok_or(DecodeError::Malformed)?;
                    request = Bytes::copy_from_slice(raw);
                }
                6 => {
                    let raw = wire::decode_length_delimited(&mut buf)
                        .ok_or(DecodeError::Malformed)?;
                    response = Bytes::copy_from_slice(raw);
                }
                7 => {
                    let value =
                        wire::decode_varint(&mut buf).ok_or(DecodeError::Malformed)?;
                    error = ErrorCode::from_u64(value).ok_or(DecodeError::Malformed)?;
                }
                _ => {
                    wire::skip_field(wire_type, &mut buf).ok_or(DecodeError::Malformed)?;
                }
            }
        }

        let kind = kind.ok_or(DecodeError::Malformed)?;
        if id <= 0 {
            return Err(DecodeError::Malformed);
        }
        Ok(RpcMessage {
            kind,
            id,
            service,
            method,
            request,
            response,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let message = RpcMessage::request(42, "m.T", "F", Bytes::from_static(b"\x01\x02\x03"));
        let decoded = RpcMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_response_round_trip() {
        let message = RpcMessage::response(7, Bytes::from_static(b"result"));
        let decoded = RpcMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.service.is_empty());
    }

    #[test]
    fn test_error_round_trip() {
        let message = RpcMessage::error(9, ErrorCode::NoMethod);
        let decoded = RpcMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Error);
        assert_eq!(decoded.error, ErrorCode::NoMethod);
    }

    #[test]
    fn test_empty_response_body_survives() {
        let message = RpcMessage::response(3, Bytes::new());
        let decoded = RpcMessage::decode(&message.encode()).unwrap();
        assert!(decoded.response.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_distinguished() {
        let mut buf = Vec::new();
        crate::wire::encode_uint64(1, 9, &mut buf);
        crate::wire::encode_uint64(2, 1, &mut buf);
        assert_eq!(RpcMessage::decode(&buf), Err(DecodeError::UnknownKind(9)));
    }

    #[test]
    fn test_missing_kind_is_malformed() {
        let mut buf = Vec::new();
        crate::wire::encode_uint64(2, 1, &mut buf);
        assert_eq!(RpcMessage::decode(&buf), Err(DecodeError::Malformed));
    }

    #[test]
    fn test_nonpositive_id_is_malformed() {
        let mut buf = Vec::new();
        crate::wire::encode_uint64(1, 1, &mut buf);
        crate::wire::encode_uint64(2, 0, &mut buf);
        assert_eq!(RpcMessage::decode(&buf), Err(DecodeError::Malformed));
    }

    #[test]
    fn test_truncated_field_is_malformed() {
        let message = RpcMessage::request(5, "svc", "m", Bytes::from_static(b"abcdef"));
        let encoded = message.encode();
        assert_eq!(
            RpcMessage::decode(&encoded[..encoded.len() - 3]),
            Err(DecodeError::Malformed)
        );
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let message = RpcMessage::request(8, "svc", "m", Bytes::from_static(b"req"));
        let mut encoded = message.encode();
        crate::wire::encode_bytes(12, b"future extension", &mut encoded);
        let decoded = RpcMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
