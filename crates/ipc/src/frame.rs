//! Wire framing: length-prefixed records, each carrying a big-endian u16
//! message type followed by a JSON payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::{
  IpcError,
  message::{Message, MessageKind},
};

/// Codec for the socket. Length prefixes are u32; the payload limit guards
/// against a garbage peer, not against legitimate traffic.
pub fn new_codec() -> LengthDelimitedCodec {
  LengthDelimitedCodec::builder().max_frame_length(64 * 1024 * 1024).new_codec()
}

/// Encode a message into one frame body (tag + JSON).
pub fn encode_message(message: &Message) -> Result<Bytes, IpcError> {
  let payload = match message {
    Message::Project(m) => serde_json::to_vec(m)?,
    Message::Query(m) => serde_json::to_vec(m)?,
    Message::CreateOutput(m) => serde_json::to_vec(m)?,
    Message::Response(m) => serde_json::to_vec(m)?,
  };
  let mut buf = BytesMut::with_capacity(payload.len() + 2);
  buf.put_u16(message.kind() as u16);
  buf.put_slice(&payload);
  Ok(buf.freeze())
}

/// Decode one frame body produced by [`encode_message`].
pub fn decode_message(frame: &[u8]) -> Result<Message, IpcError> {
  if frame.len() < 2 {
    return Err(IpcError::ShortFrame);
  }
  let tag = u16::from_be_bytes([frame[0], frame[1]]);
  let payload = &frame[2..];
  let kind = MessageKind::from_tag(tag).ok_or(IpcError::UnknownMessage(tag))?;
  let message = match kind {
    MessageKind::Project => Message::Project(serde_json::from_slice(payload)?),
    MessageKind::Query => Message::Query(serde_json::from_slice(payload)?),
    MessageKind::CreateOutput => Message::CreateOutput(serde_json::from_slice(payload)?),
    MessageKind::Response => Message::Response(serde_json::from_slice(payload)?),
  };
  Ok(message)
}
