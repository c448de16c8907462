//! Wire message payloads.
//!
//! Every record on the socket is one of four messages, identified by a
//! 16-bit type tag in the frame (see [`crate::frame`]). Payloads are plain
//! serde structs; the daemon never sees raw bytes past the frame layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ============================================================================
// Message envelope
// ============================================================================

/// Frame-level message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
  Project = 1,
  Query = 2,
  CreateOutput = 3,
  Response = 4,
}

impl MessageKind {
  pub fn from_tag(tag: u16) -> Option<Self> {
    match tag {
      1 => Some(MessageKind::Project),
      2 => Some(MessageKind::Query),
      3 => Some(MessageKind::CreateOutput),
      4 => Some(MessageKind::Response),
      _ => None,
    }
  }
}

/// A decoded message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
  Project(ProjectMessage),
  Query(QueryMessage),
  CreateOutput(CreateOutputMessage),
  Response(ResponseMessage),
}

impl Message {
  pub fn kind(&self) -> MessageKind {
    match self {
      Message::Project(_) => MessageKind::Project,
      Message::Query(_) => MessageKind::Query,
      Message::CreateOutput(_) => MessageKind::CreateOutput,
      Message::Response(_) => MessageKind::Response,
    }
  }
}

// ============================================================================
// ProjectMessage
// ============================================================================

/// What kind of project a [`ProjectMessage`] registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectKind {
  Makefile,
  GrTags,
  Smart,
}

/// Option flags on project registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFlags {
  /// Append `-B` to the build-tool arguments (force remake).
  #[serde(default)]
  pub use_dash_b: bool,
  /// Disable the build-tool override tricks.
  #[serde(default)]
  pub no_make_tricks: bool,
  /// Ingest immediately even when the project is already valid.
  #[serde(default)]
  pub automake: bool,
}

/// Add or replace a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMessage {
  pub kind: ProjectKind,
  pub path: PathBuf,
  /// Build-tool arguments (makefile projects).
  #[serde(default)]
  pub args: Vec<String>,
  /// Extra compiler flags appended to every compile command.
  #[serde(default)]
  pub extra_flags: Vec<String>,
  #[serde(default)]
  pub flags: ProjectFlags,
}

// ============================================================================
// QueryMessage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
  FindFile,
  DumpFile,
  DeleteProject,
  UnloadProject,
  ReloadProjects,
  Project,
  Reindex,
  ClearProjects,
  FixIts,
  Errors,
  CursorInfo,
  Shutdown,
  FollowLocation,
  ReferencesLocation,
  ReferencesName,
  ListSymbols,
  FindSymbols,
  Status,
  IsIndexed,
  HasFileManager,
  PreprocessFile,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFlags {
  /// Treat the query string as a regular expression where supported.
  #[serde(default)]
  pub match_regexp: bool,
  /// Suppress informational reply lines.
  #[serde(default)]
  pub silent: bool,
}

/// One query. `query` is the subtype's argument: a location string
/// (`file:line:col`) for location queries, a path or pattern otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMessage {
  pub kind: QueryKind,
  #[serde(default)]
  pub query: String,
  #[serde(default)]
  pub flags: QueryFlags,
}

impl QueryMessage {
  pub fn new(kind: QueryKind, query: impl Into<String>) -> Self {
    Self {
      kind,
      query: query.into(),
      flags: QueryFlags::default(),
    }
  }
}

// ============================================================================
// CreateOutputMessage & ResponseMessage
// ============================================================================

/// Attach the sending connection as a log sink at the given verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutputMessage {
  pub level: i32,
}

/// One streamed reply line. `finish` marks the end of the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
  #[serde(default)]
  pub out: String,
  #[serde(default)]
  pub finish: bool,
}

impl ResponseMessage {
  pub fn line(out: impl Into<String>) -> Self {
    Self {
      out: out.into(),
      finish: false,
    }
  }

  pub fn finish() -> Self {
    Self {
      out: String::new(),
      finish: true,
    }
  }

  pub fn last(out: impl Into<String>) -> Self {
    Self {
      out: out.into(),
      finish: true,
    }
  }
}
