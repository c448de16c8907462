//! Persistent data model for the cnav daemon.
//!
//! This crate owns everything that touches disk or is shared between the
//! dispatcher, the indexer and query jobs:
//!
//! - the typed KV adapter over the per-project store file ([`ProjectStores`])
//! - the process-wide path interner ([`PathTable`])
//! - the shared index records ([`Location`], [`CursorInfo`], [`SourceInfo`],
//!   [`FileInformation`])
//! - versioned blob read/write used for crash-safe snapshots

mod blob;
mod kv;
mod paths;
mod types;

pub use blob::{read_versioned, write_versioned};
pub use kv::{ProjectStores, StoreBatch, StoreId};
pub use paths::PathTable;
pub use types::{
  CursorInfo, DependencyMap, FileId, FileInformation, Location, RefKind, ReferenceMap, SourceInfo, SymbolKind,
  SymbolMap, SymbolNameMap,
};

/// Schema version written in front of every persisted blob. A mismatch on
/// restore means the blob is ignored and the state is rebuilt from scratch.
pub const SCHEMA_VERSION: u32 = 3;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("failed to open store: {0}")]
  Open(#[from] redb::DatabaseError),
  #[error("store transaction failed: {0}")]
  Transaction(#[from] redb::TransactionError),
  #[error("store table error: {0}")]
  Table(#[from] redb::TableError),
  #[error("store access error: {0}")]
  Storage(#[from] redb::StorageError),
  #[error("store commit failed: {0}")]
  Commit(#[from] redb::CommitError),
  #[error("encode/decode failed: {0}")]
  Codec(#[from] bincode::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
