//! IPC protocol for the cnav daemon: message payloads, wire framing, and a
//! small client used by tools, tests, and the daemon's own listen handshake.

mod client;
mod error;
mod frame;
mod message;

pub use client::Client;
pub use error::IpcError;
pub use frame::{decode_message, encode_message, new_codec};
pub use message::{
  CreateOutputMessage, Message, MessageKind, ProjectFlags, ProjectKind, ProjectMessage, QueryFlags, QueryKind,
  QueryMessage, ResponseMessage,
};
