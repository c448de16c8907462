//! Client side of the socket protocol.
//!
//! Used by command-line tools and tests, and by the daemon itself to ask a
//! stale instance to shut down during the listen retry loop.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::{
  IpcError,
  frame::{decode_message, encode_message, new_codec},
  message::{Message, QueryMessage, ResponseMessage},
};

pub struct Client {
  framed: Framed<UnixStream, tokio_util::codec::LengthDelimitedCodec>,
}

impl Client {
  pub async fn connect(socket: &Path) -> Result<Self, IpcError> {
    let stream = UnixStream::connect(socket)
      .await
      .map_err(|e| IpcError::Connection(format!("{}: {}", socket.display(), e)))?;
    Ok(Self {
      framed: Framed::new(stream, new_codec()),
    })
  }

  pub async fn send(&mut self, message: &Message) -> Result<(), IpcError> {
    let bytes = encode_message(message)?;
    self.framed.send(bytes).await?;
    Ok(())
  }

  /// Next message from the daemon; `None` when the connection closed.
  pub async fn recv(&mut self) -> Result<Option<Message>, IpcError> {
    match self.framed.next().await {
      Some(frame) => Ok(Some(decode_message(&frame?)?)),
      None => Ok(None),
    }
  }

  /// Send a query and collect reply lines until the finish marker.
  pub async fn query(&mut self, query: QueryMessage) -> Result<Vec<String>, IpcError> {
    self.send(&Message::Query(query)).await?;
    self.collect_responses().await
  }

  /// Drain response messages until one carries `finish`.
  pub async fn collect_responses(&mut self) -> Result<Vec<String>, IpcError> {
    let mut lines = Vec::new();
    loop {
      match self.recv().await? {
        Some(Message::Response(ResponseMessage { out, finish })) => {
          if !out.is_empty() {
            lines.push(out);
          }
          if finish {
            return Ok(lines);
          }
        }
        Some(other) => trace!(kind = ?other.kind(), "ignoring non-response message"),
        None => return Err(IpcError::Closed),
      }
    }
  }
}
