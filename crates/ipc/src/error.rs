#[derive(Debug, thiserror::Error)]
pub enum IpcError {
  #[error("Ser/de error: {0}")]
  Serde(#[from] serde_json::Error),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Unknown message type: {0}")]
  UnknownMessage(u16),
  #[error("Frame too short")]
  ShortFrame,
  #[error("Connection error: {0}")]
  Connection(String),
  #[error("Connection closed")]
  Closed,
}
