//! RPC framing.
//!
//! Every message travels in one checksummed frame, big-endian throughout:
//!
//! ```text
//! Field     Length   Content
//! size      4 bytes  N + 8
//! tag       4 bytes  "RPC0"
//! payload   N bytes  encoded envelope
//! checksum  4 bytes  Adler-32 of tag || payload
//! ```
//!
//! `size` covers everything after itself. Partial frames stay in the input
//! buffer; any framing failure is fatal for the connection that produced it.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use rivet_net::TcpConnectionPtr;

use crate::message::{DecodeError, RpcMessage};
use crate::metrics::CODEC_ERRORS;

/// Length of the size prefix. Not counted by the size field itself.
pub const HEADER_LEN: usize = 4;
pub const TAG: [u8; 4] = *b"RPC0";
pub const TAG_LEN: usize = 4;
pub const CHECKSUM_LEN: usize = 4;
/// Smallest legal size-field value: an empty payload still carries the tag
/// and checksum.
pub const MIN_FRAME_LEN: usize = TAG_LEN + CHECKSUM_LEN;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const ADLER_MOD: u32 = 65521;
/// Largest run of bytes before the accumulators must be reduced mod 65521.
const ADLER_NMAX: usize = 5552;

/// Adler-32 over `data`, per RFC 1950.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(ADLER_NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame length {0} outside [{MIN_FRAME_LEN}, {MAX_FRAME_LEN}]")]
    InvalidLength(usize),
    #[error("bad frame tag")]
    BadTag,
    #[error("checksum mismatch")]
    Checksum,
    #[error("unknown message kind: {0}")]
    UnknownKind(u64),
    #[error("malformed envelope")]
    Parse,
}

/// Serialize `message` into a complete frame.
///
/// Oversized messages fail here, before anything reaches a connection.
pub fn encode(message: &RpcMessage) -> Result<Bytes, CodecError> {
    let payload = message.encode();
    let frame_len = TAG_LEN + payload.len() + CHECKSUM_LEN;
    if frame_len > MAX_FRAME_LEN {
        return Err(CodecError::InvalidLength(frame_len));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame_len);
    buf.put_u32(frame_len as u32);
    buf.put_slice(&TAG);
    buf.put_slice(&payload);
    let checksum = adler32(&buf[HEADER_LEN..]);
    buf.put_u32(checksum);
    Ok(buf.freeze())
}

/// Pull one complete frame off the front of `buf`.
///
/// `Ok(None)` means the buffer holds only a partial frame; it is left
/// untouched for the next read. Errors leave the buffer untouched too; the
/// caller closes the connection.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<RpcMessage>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&size) {
        return Err(CodecError::InvalidLength(size));
    }
    if buf.len() < HEADER_LEN + size {
        return Ok(None);
    }

    if buf[HEADER_LEN..HEADER_LEN + TAG_LEN] != TAG {
        return Err(CodecError::BadTag);
    }

    let checked = &buf[HEADER_LEN..HEADER_LEN + size - CHECKSUM_LEN];
    let expected = u32::from_be_bytes([
        buf[HEADER_LEN + size - 4],
        buf[HEADER_LEN + size - 3],
        buf[HEADER_LEN + size - 2],
        buf[HEADER_LEN + size - 1],
    ]);
    if adler32(checked) != expected {
        return Err(CodecError::Checksum);
    }

    let message = match RpcMessage::decode(&buf[HEADER_LEN + TAG_LEN..HEADER_LEN + size - CHECKSUM_LEN])
    {
        Ok(message) => message,
        Err(DecodeError::UnknownKind(kind)) => return Err(CodecError::UnknownKind(kind)),
        Err(DecodeError::Malformed) => return Err(CodecError::Parse),
    };

    buf.advance(HEADER_LEN + size);
    Ok(Some(message))
}

/// Invoked once per decoded envelope, on the connection's loop thread.
pub type RpcMessageCallback = Arc<dyn Fn(&TcpConnectionPtr, RpcMessage) + Send + Sync>;

/// Stream-side of the framing: feeds decoded envelopes to its callback and
/// writes encoded frames through the connection.
pub struct RpcCodec {
    on_message: RpcMessageCallback,
}

impl RpcCodec {
    pub fn new(on_message: RpcMessageCallback) -> RpcCodec {
        RpcCodec { on_message }
    }

    /// Serialize and hand the frame to the connection; the write lands on
    /// the connection's owning loop regardless of the calling thread.
    pub fn send(&self, conn: &TcpConnectionPtr, message: &RpcMessage) {
        match encode(message) {
            Ok(frame) => conn.send(&frame),
            Err(e) => {
                CODEC_ERRORS.increment();
                error!(conn = conn.name(), error = %e, "dropping unencodable message");
            }
        }
    }

    /// Drain complete frames from the connection's input buffer. A codec
    /// error closes the connection; the message callback never sees the
    /// offending frame.
    pub fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut BytesMut) {
        loop {
            match decode_frame(buf) {
                Ok(Some(message)) => {
                    trace!(conn = conn.name(), id = message.id, "frame decoded");
                    (self.on_message)(conn, message);
                }
                Ok(None) => break,
                Err(e) => {
                    CODEC_ERRORS.increment();
                    error!(conn = conn.name(), error = %e, "codec error, closing connection");
                    buf.clear();
                    conn.shutdown();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;

    #[test]
    fn test_adler32_vectors() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_adler32_long_input_reduction() {
        // Exercises the block reduction past NMAX.
        let data = vec![0xFFu8; 3 * ADLER_NMAX + 17];
        let slow = {
            let mut a: u64 = 1;
            let mut b: u64 = 0;
            for &byte in &data {
                a = (a + byte as u64) % ADLER_MOD as u64;
                b = (b + a) % ADLER_MOD as u64;
            }
            ((b as u32) << 16) | a as u32
        };
        assert_eq!(adler32(&data), slow);
    }

    #[test]
    fn test_frame_layout() {
        let message = RpcMessage::request(42, "m.T", "F", Bytes::from_static(b"\x01\x02\x03"));
        let frame = encode(&message).unwrap();
        let payload = message.encode();

        let size = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(size, frame.len() - HEADER_LEN);
        assert_eq!(size, TAG_LEN + payload.len() + CHECKSUM_LEN);
        assert_eq!(&frame[4..8], b"RPC0");
        assert_eq!(&frame[8..8 + payload.len()], &payload[..]);

        let trailer =
            u32::from_be_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(trailer, adler32(&frame[HEADER_LEN..frame.len() - CHECKSUM_LEN]));
    }

    #[test]
    fn test_round_trip() {
        let message = RpcMessage::request(42, "m.T", "F", Bytes::from_static(b"\x01\x02\x03"));
        let frame = encode(&message).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames_left_in_buffer() {
        let message = RpcMessage::response(1, Bytes::from_static(b"abc"));
        let frame = encode(&message).unwrap();

        // Every split point must yield nothing, then exactly one message.
        for split in 0..frame.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&frame[..split]);
            assert_eq!(decode_frame(&mut buf).unwrap(), None, "split at {split}");

            buf.extend_from_slice(&frame[split..]);
            let decoded = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, message, "split at {split}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let first = RpcMessage::request(1, "s", "a", Bytes::from_static(b"x"));
        let second = RpcMessage::request(2, "s", "b", Bytes::from_static(b"y"));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&first).unwrap());
        buf.extend_from_slice(&encode(&second).unwrap());

        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), second);
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_payload_tamper_is_checksum_error() {
        let message = RpcMessage::request(42, "m.T", "F", Bytes::from_static(b"\x01\x02\x03"));
        let frame = encode(&message).unwrap();

        let mut tampered = BytesMut::from(&frame[..]);
        // One bit, payload region.
        tampered[HEADER_LEN + TAG_LEN + 1] ^= 0x01;
        assert_eq!(decode_frame(&mut tampered), Err(CodecError::Checksum));
    }

    #[test]
    fn test_tag_tamper_is_bad_tag() {
        let message = RpcMessage::response(5, Bytes::from_static(b"ok"));
        let frame = encode(&message).unwrap();

        let mut tampered = BytesMut::from(&frame[..]);
        tampered[HEADER_LEN] = b'X';
        assert_eq!(decode_frame(&mut tampered), Err(CodecError::BadTag));
    }

    #[test]
    fn test_undersized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4); // below the tag+checksum floor
        buf.put_slice(b"RPC0");
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CodecError::InvalidLength(4))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32 + 1);
        buf.put_slice(b"RPC0");
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_oversized_message_fails_encode() {
        let message = RpcMessage::request(
            1,
            "s",
            "m",
            Bytes::from(vec![0u8; MAX_FRAME_LEN]),
        );
        assert!(matches!(
            encode(&message),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_unknown_kind_surfaces_distinctly() {
        let mut payload = Vec::new();
        crate::wire::encode_uint64(1, 9, &mut payload);
        crate::wire::encode_uint64(2, 1, &mut payload);
        let mut buf = raw_frame(&payload);
        assert_eq!(decode_frame(&mut buf), Err(CodecError::UnknownKind(9)));
    }

    #[test]
    fn test_garbage_payload_is_parse_error() {
        let mut buf = raw_frame(&[0x80]);
        assert_eq!(decode_frame(&mut buf), Err(CodecError::Parse));
    }

    #[test]
    fn test_error_envelope_round_trip() {
        let message = RpcMessage::error(11, ErrorCode::NoService);
        let frame = encode(&message).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.error, ErrorCode::NoService);
    }

    /// Frame an arbitrary payload with a correct tag and checksum.
    fn raw_frame(payload: &[u8]) -> BytesMut {
        let size = TAG_LEN + payload.len() + CHECKSUM_LEN;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + size);
        buf.put_u32(size as u32);
        buf.put_slice(&TAG);
        buf.put_slice(payload);
        let checksum = adler32(&buf[HEADER_LEN..]);
        buf.put_u32(checksum);
        buf
    }
}
