//! The cnav daemon core.
//!
//! A long-running process that ingests C/C++ source trees and answers
//! code-navigation queries over a local socket.
//!
//! # Architecture
//!
//! ```text
//! Server (event loop: owns registry, pending lookups, save timers)
//!   ├── connection tasks (framed read/write, one pair per client)
//!   ├── JobPool (OS threads: parser jobs + query jobs, priority ordered)
//!   ├── per-project Indexer
//!   │     └── writer thread (staging buffer -> KV stores)
//!   ├── build ingester tasks (dry-run output -> FileReady events)
//!   └── makefile watcher (notify -> re-ingest events)
//! ```
//!
//! Everything that mutates the project registry or the pending-lookups
//! table happens on the event loop; workers only post [`event::ServerEvent`]s
//! back through a channel.

pub mod config;
pub mod event;
pub mod index;
pub mod ingest;
pub mod persist;
pub mod pool;
pub mod project;
pub mod projects_file;
pub mod query;
pub mod registry;
pub mod server;
pub mod watch;

pub use config::Options;
pub use server::Server;

/// Errors that abort daemon startup. Runtime errors inside handlers are
/// logged and answered over the wire instead.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error("unable to listen on {0} after {1} attempts")]
  Listen(std::path::PathBuf, u32),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("store error: {0}")]
  Store(#[from] cnav_store::StoreError),
  #[error("ipc error: {0}")]
  Ipc(#[from] cnav_ipc::IpcError),
}
