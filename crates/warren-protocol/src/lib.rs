//! Wire protocol for warren tracker communication.
//!
//! The envelope is a pair of closed tagged unions (`ClientMessage`,
//! `ServerMessage`) serialized as MessagePack. Over TCP, frames carry a
//! 4-byte big-endian length prefix; over UDP, the same envelope is the raw
//! datagram payload (punch messages only).

pub mod codec;
pub mod message;

pub use codec::{
    decode_datagram, decode_server_datagram, encode_client_datagram, encode_datagram, AgentCodec,
    CodecError, TrackerCodec, MAX_FRAME_SIZE,
};
pub use message::{
    ClientMessage, ConnectionInfo, ConnectionsList, DaemonInfo, ImportEntry, ResultCode,
    ServerMessage, TreeNode,
};
