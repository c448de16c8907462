//! Events posted back to the dispatcher loop.
//!
//! Workers, ingester tasks, the watcher and the indexer writer threads all
//! communicate with the event loop through one unbounded channel of tagged
//! variants; a single handler switches on the tag.

use std::path::PathBuf;

use cnav_ipc::Message;

use crate::{ingest::CompileCommand, pool::JobId};

/// Identifies one client connection for the lifetime of the daemon.
pub type ConnId = u64;

/// Output from a running job. Per job, events arrive in emit order; the
/// final one carries `finish`.
#[derive(Debug)]
pub struct JobEvent {
  pub id: JobId,
  pub out: Option<String>,
  pub finish: bool,
}

/// Indexer lifecycle notifications driving the persistence controller.
#[derive(Debug)]
pub enum IndexEvent {
  /// A writer cycle flushed deltas covering `count` files.
  JobsComplete { project: PathBuf, count: usize },
  /// Parsing began while the indexer was idle.
  JobStarted { project: PathBuf, path: PathBuf },
}

#[derive(Debug)]
pub enum ServerEvent {
  /// A decoded message from a client.
  Message { conn: ConnId, message: Message },
  /// A client connection went away (EOF or write failure).
  Disconnected { conn: ConnId },
  /// Output from a pool job.
  Job(JobEvent),
  /// The build ingester produced one compile command.
  FileReady { project: PathBuf, command: CompileCommand },
  /// The build ingester finished (`ok` is false when the dry run failed).
  IngestDone { project: PathBuf, conn: Option<ConnId>, ok: bool },
  /// Indexer writer notifications.
  Index(IndexEvent),
  /// A watched makefile changed on disk.
  MakefileModified { path: PathBuf },
}
