//! Framing and serialization for tracker traffic.
//!
//! TCP frames are a 4-byte big-endian payload length followed by the
//! MessagePack-encoded message. UDP datagrams carry the same MessagePack
//! payload with no length prefix (the datagram boundary is the frame).

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{ClientMessage, ServerMessage};

/// Upper bound on a single frame's payload. Large enough for a full
/// connections-list or tree snapshot, small enough to bound per-session
/// buffering.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const LEN_PREFIX: usize = 4;

/// Errors raised while framing or parsing tracker traffic.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds maximum of {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),
}

fn decode_frame<T: DeserializeOwned>(src: &mut BytesMut) -> Result<Option<T>, CodecError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }

    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }

    if src.len() < LEN_PREFIX + len {
        // Reserve for the rest of the frame so the next read can complete it.
        src.reserve(LEN_PREFIX + len - src.len());
        return Ok(None);
    }

    src.advance(LEN_PREFIX);
    let payload = src.split_to(len);
    let message = rmp_serde::from_slice(&payload)?;
    Ok(Some(message))
}

fn encode_frame<T: Serialize>(item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = rmp_serde::to_vec_named(item)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    dst.reserve(LEN_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

/// Tracker-side codec: decodes `ClientMessage`, encodes `ServerMessage`.
#[derive(Debug, Default)]
pub struct TrackerCodec;

impl Decoder for TrackerCodec {
    type Item = ClientMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<ServerMessage> for TrackerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

/// Daemon-side codec: decodes `ServerMessage`, encodes `ClientMessage`.
/// The mirror image of [`TrackerCodec`], used by integration tests.
#[derive(Debug, Default)]
pub struct AgentCodec;

impl Decoder for AgentCodec {
    type Item = ServerMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<ClientMessage> for AgentCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

/// Encodes a server message as an unframed UDP datagram payload.
pub fn encode_datagram(message: &ServerMessage) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Encodes a client message as an unframed UDP datagram payload.
pub fn encode_client_datagram(message: &ClientMessage) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes a UDP datagram into a client message.
pub fn decode_datagram(payload: &[u8]) -> Result<ClientMessage, CodecError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Decodes a UDP datagram into a server message (daemon side).
pub fn decode_server_datagram(payload: &[u8]) -> Result<ServerMessage, CodecError> {
    Ok(rmp_serde::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResultCode;

    #[test]
    fn test_tracker_roundtrip_single_frame() {
        let mut agent = AgentCodec;
        let mut tracker = TrackerCodec;
        let mut buf = BytesMut::new();

        let msg = ClientMessage::Connect {
            message_id: 42,
            token: "abcd".into(),
        };
        agent.encode(msg, &mut buf).expect("encode");

        let decoded = tracker.decode(&mut buf).expect("decode").expect("complete");
        match decoded {
            ClientMessage::Connect { message_id, token } => {
                assert_eq!(message_id, 42);
                assert_eq!(token, "abcd");
            }
            other => panic!("expected Connect, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut agent = AgentCodec;
        let mut tracker = TrackerCodec;
        let mut buf = BytesMut::new();
        agent
            .encode(ClientMessage::Alive, &mut buf)
            .expect("encode");

        let full = buf.split();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(tracker.decode(&mut partial).expect("decode").is_none());

        partial.put_slice(&full[full.len() - 1..]);
        assert!(tracker.decode(&mut partial).expect("decode").is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut agent = AgentCodec;
        let mut tracker = TrackerCodec;
        let mut buf = BytesMut::new();
        agent
            .encode(ClientMessage::Alive, &mut buf)
            .expect("encode");
        agent
            .encode(
                ClientMessage::Tree {
                    message_id: 1,
                    path: "/".into(),
                },
                &mut buf,
            )
            .expect("encode");

        assert!(matches!(
            tracker.decode(&mut buf).expect("decode"),
            Some(ClientMessage::Alive)
        ));
        assert!(matches!(
            tracker.decode(&mut buf).expect("decode"),
            Some(ClientMessage::Tree { message_id: 1, .. })
        ));
        assert!(tracker.decode(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut tracker = TrackerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);

        match tracker.decode(&mut buf) {
            Err(CodecError::FrameTooLarge(n)) => assert_eq!(n, MAX_FRAME_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_server_frame_roundtrip() {
        let mut tracker = TrackerCodec;
        let mut agent = AgentCodec;
        let mut buf = BytesMut::new();

        tracker
            .encode(
                ServerMessage::Confirmed {
                    message_id: 7,
                    result: ResultCode::Accepted,
                    token: Some("deadbeef".into()),
                },
                &mut buf,
            )
            .expect("encode");

        match agent.decode(&mut buf).expect("decode").expect("complete") {
            ServerMessage::Confirmed {
                message_id,
                result,
                token,
            } => {
                assert_eq!(message_id, 7);
                assert_eq!(result, ResultCode::Accepted);
                assert_eq!(token.as_deref(), Some("deadbeef"));
            }
            other => panic!("expected Confirmed, got {other:?}"),
        }
    }

    #[test]
    fn test_datagram_roundtrip() {
        let payload = encode_client_datagram(&ClientMessage::AddressResponse { request_id: 5 })
            .expect("encode");
        match decode_datagram(&payload).expect("decode") {
            ClientMessage::AddressResponse { request_id } => assert_eq!(request_id, 5),
            other => panic!("expected AddressResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_address_request_datagram_roundtrip() {
        let payload =
            encode_datagram(&ServerMessage::AddressRequest { request_id: 9 }).expect("encode");
        match decode_server_datagram(&payload).expect("decode") {
            ServerMessage::AddressRequest { request_id } => assert_eq!(request_id, 9),
            other => panic!("expected AddressRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_datagram_rejected() {
        assert!(decode_datagram(&[0xc1, 0xff, 0x00]).is_err());
    }
}
