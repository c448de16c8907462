//! The dispatcher.
//!
//! One event loop owns the project registry, the pending-lookups table and
//! the save timers. Connection tasks decode frames and forward them here;
//! pool jobs, ingester tasks, the indexer writers and the watcher post
//! events through the same channel. Nothing else touches the loop state.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use regex::Regex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cnav_frontend::TranslationUnitProvider;
use cnav_ipc::{
  Client, CreateOutputMessage, Message, ProjectKind, ProjectMessage, QueryKind, QueryMessage, ResponseMessage,
  decode_message, encode_message, new_codec,
};
use cnav_store::{PathTable, SCHEMA_VERSION, SourceInfo};

use crate::{
  DaemonError, Options,
  event::{ConnId, IndexEvent, JobEvent, ServerEvent},
  index::IndexJob,
  ingest::{self, CompileCommand, IngestConfig, Language},
  persist::{self, SaveTimers},
  pool::{Job, JobHandle, JobIdGenerator, JobPool, Priority},
  project::Project,
  projects_file::{MakefileInfo, ProjectsFile},
  query::{
    CursorInfoJob, DumpFileJob, FindFileJob, FindSymbolsJob, FollowLocationJob, ListSymbolsJob, PreprocessJob,
    ReferencesJob, ReferencesQuery, StatusJob, parse_location,
  },
  registry::{ProjectRegistry, find_project_root},
  watch::MakefileWatcher,
};

const LISTEN_ATTEMPTS: u32 = 10;

enum Flow {
  Continue,
  Shutdown,
}

struct Pending {
  conn: ConnId,
  handle: JobHandle,
}

struct State {
  options: Options,
  default_args: Vec<String>,
  home: PathBuf,
  paths: Arc<PathTable>,
  provider: Arc<dyn TranslationUnitProvider>,
  pool: JobPool,
  events: UnboundedSender<ServerEvent>,
  watcher: MakefileWatcher,

  registry: ProjectRegistry,
  makefiles: HashMap<PathBuf, MakefileInfo>,
  grtags: Vec<PathBuf>,
  smart: HashMap<PathBuf, Vec<String>>,

  conns: HashMap<ConnId, UnboundedSender<Message>>,
  next_conn: ConnId,
  pending: HashMap<u32, Pending>,
  ids: JobIdGenerator,
  log_sinks: HashMap<ConnId, i32>,
  /// Connections that asked for quiet mode; they get finish markers only.
  silent: HashSet<ConnId>,
  ingests: HashMap<PathBuf, CancellationToken>,
  timers: SaveTimers,
}

/// The daemon. `run` blocks until a shutdown query arrives.
pub struct Server {
  options: Options,
  provider: Arc<dyn TranslationUnitProvider>,
}

impl Server {
  pub fn new(options: Options, provider: Arc<dyn TranslationUnitProvider>) -> Self {
    Self { options, provider }
  }

  pub async fn run(self) -> Result<(), DaemonError> {
    let options = self.options.clone();

    if options.clear_projects && options.data_dir.exists() {
      info!(dir = %options.data_dir.display(), "clearing project data");
      let _ = std::fs::remove_dir_all(&options.data_dir);
    }
    std::fs::create_dir_all(&options.data_dir)?;

    let listener = bind_socket(&options).await?;
    info!(socket = %options.socket_path.display(), "listening");

    let paths = Arc::new(PathTable::new());
    restore_paths(&options, &paths);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pool = JobPool::new(options.worker_threads(), events_tx.clone());
    let watcher = MakefileWatcher::new(events_tx.clone());

    let mut state = State {
      default_args: options.effective_default_args(),
      home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
      options,
      paths,
      provider: self.provider,
      pool,
      events: events_tx,
      watcher,
      registry: ProjectRegistry::new(),
      makefiles: HashMap::new(),
      grtags: Vec::new(),
      smart: HashMap::new(),
      conns: HashMap::new(),
      next_conn: 1,
      pending: HashMap::new(),
      ids: JobIdGenerator::default(),
      log_sinks: HashMap::new(),
      silent: HashSet::new(),
      ingests: HashMap::new(),
      timers: SaveTimers::default(),
    };

    reload_projects(&mut state);
    event_loop(&mut state, listener, events_rx).await;
    teardown(state);
    Ok(())
  }
}

// ============================================================================
// Startup
// ============================================================================

/// Bind the socket, retrying up to ten times. The first failure asks any
/// existing listener to shut down; each retry removes the stale socket file.
async fn bind_socket(options: &Options) -> Result<UnixListener, DaemonError> {
  if let Some(parent) = options.socket_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  for attempt in 0..LISTEN_ATTEMPTS {
    match UnixListener::bind(&options.socket_path) {
      Ok(listener) => return Ok(listener),
      Err(e) => {
        warn!(attempt, error = %e, "cannot bind socket");
        if attempt == 0 {
          if let Ok(mut client) = Client::connect(&options.socket_path).await {
            let _ = client
              .send(&Message::Query(QueryMessage::new(QueryKind::Shutdown, "")))
              .await;
          }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = std::fs::remove_file(&options.socket_path);
      }
    }
  }
  Err(DaemonError::Listen(options.socket_path.clone(), LISTEN_ATTEMPTS))
}

/// Adopt the persisted path table. A version mismatch rebuilds from scratch
/// and discards every store keyed by the old ids.
fn restore_paths(options: &Options, paths: &PathTable) {
  let blob = persist::paths_blob_path(&options.data_dir);
  if !blob.exists() {
    return;
  }
  match paths.restore(&blob, SCHEMA_VERSION) {
    Ok(true) => info!(count = paths.len(), "restored path table"),
    Ok(false) | Err(_) => {
      warn!("path table unusable; discarding stored indices");
      let _ = std::fs::remove_dir_all(&options.data_dir);
      let _ = std::fs::create_dir_all(&options.data_dir);
    }
  }
}

// ============================================================================
// Event loop
// ============================================================================

async fn event_loop(state: &mut State, listener: UnixListener, mut events: UnboundedReceiver<ServerEvent>) {
  loop {
    let next_save = state.timers.next_deadline();
    tokio::select! {
      accepted = listener.accept() => {
        match accepted {
          Ok((stream, _)) => accept_connection(state, stream),
          Err(e) => error!(error = %e, "accept failed"),
        }
      }

      event = events.recv() => {
        let Some(event) = event else { break };
        match handle_event(state, event) {
          Flow::Continue => {}
          Flow::Shutdown => break,
        }
      }

      _ = sleep_until_deadline(next_save), if next_save.is_some() => {
        fire_save_timers(state);
      }
    }
  }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
    None => std::future::pending().await,
  }
}

fn accept_connection(state: &mut State, stream: UnixStream) {
  let conn = state.next_conn;
  state.next_conn += 1;

  let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
  state.conns.insert(conn, tx);

  let framed = Framed::new(stream, new_codec());
  let (mut sink, mut read) = framed.split();

  let events = state.events.clone();
  tokio::spawn(async move {
    while let Some(message) = rx.recv().await {
      let Ok(bytes) = encode_message(&message) else { continue };
      if sink.send(bytes).await.is_err() {
        break;
      }
    }
    let _ = events.send(ServerEvent::Disconnected { conn });
  });

  let events = state.events.clone();
  tokio::spawn(async move {
    while let Some(frame) = read.next().await {
      let Ok(frame) = frame else { break };
      match decode_message(&frame) {
        Ok(message) => {
          let _ = events.send(ServerEvent::Message { conn, message });
        }
        // Protocol errors are logged and the message ignored.
        Err(e) => warn!(error = %e, "undecodable message"),
      }
    }
    let _ = events.send(ServerEvent::Disconnected { conn });
  });

  debug!(conn, "client connected");
}

fn handle_event(state: &mut State, event: ServerEvent) -> Flow {
  match event {
    ServerEvent::Message { conn, message } => match message {
      Message::Project(m) => {
        handle_project_message(state, conn, m);
        Flow::Continue
      }
      Message::Query(q) => handle_query_message(state, conn, q),
      Message::CreateOutput(CreateOutputMessage { level }) => {
        state.log_sinks.insert(conn, level);
        Flow::Continue
      }
      Message::Response(_) => {
        warn!(conn, "unexpected response message from client");
        Flow::Continue
      }
    },
    ServerEvent::Disconnected { conn } => {
      drop_connection(state, conn);
      Flow::Continue
    }
    ServerEvent::Job(event) => {
      handle_job_event(state, event);
      Flow::Continue
    }
    ServerEvent::FileReady { project, command } => {
      process_source_file(state, &project, command);
      Flow::Continue
    }
    ServerEvent::IngestDone { project, conn, ok } => {
      handle_ingest_done(state, &project, conn, ok);
      Flow::Continue
    }
    ServerEvent::Index(IndexEvent::JobsComplete { project, count }) => {
      if count > 0 {
        state.timers.arm(&project, Instant::now());
      }
      Flow::Continue
    }
    ServerEvent::Index(IndexEvent::JobStarted { project, .. }) => {
      state.timers.disarm(&project);
      Flow::Continue
    }
    ServerEvent::MakefileModified { path } => {
      handle_makefile_modified(state, &path);
      Flow::Continue
    }
  }
}

// ============================================================================
// Replies & connection bookkeeping
// ============================================================================

fn reply(state: &State, conn: ConnId, line: impl Into<String>) {
  if state.silent.contains(&conn) {
    return;
  }
  if let Some(tx) = state.conns.get(&conn) {
    let _ = tx.send(Message::Response(ResponseMessage::line(line)));
  }
}

fn reply_finish(state: &State, conn: ConnId) {
  if let Some(tx) = state.conns.get(&conn) {
    let _ = tx.send(Message::Response(ResponseMessage::finish()));
  }
}

/// Forward a line to every registered log sink at or above `level`.
fn broadcast_log(state: &State, level: i32, line: &str) {
  for (conn, sink_level) in &state.log_sinks {
    if *sink_level >= level {
      reply(state, *conn, line);
    }
  }
}

/// Purge every pending lookup owned by a dropped connection and abort the
/// jobs behind them.
fn drop_connection(state: &mut State, conn: ConnId) {
  if state.conns.remove(&conn).is_none() {
    return;
  }
  state.log_sinks.remove(&conn);
  state.silent.remove(&conn);
  let stale: Vec<u32> = state
    .pending
    .iter()
    .filter(|(_, pending)| pending.conn == conn)
    .map(|(id, _)| *id)
    .collect();
  for id in stale {
    if let Some(pending) = state.pending.remove(&id) {
      pending.handle.abort();
    }
  }
  debug!(conn, "client disconnected");
}

fn handle_job_event(state: &mut State, event: JobEvent) {
  let Some(pending) = state.pending.get(&event.id) else {
    // Job already forgotten; nothing to deliver, nothing to abort.
    return;
  };
  if !state.conns.contains_key(&pending.conn) {
    pending.handle.abort();
    state.pending.remove(&event.id);
    return;
  }
  let conn = pending.conn;
  if let Some(out) = event.out {
    reply(state, conn, out);
  }
  if event.finish {
    reply_finish(state, conn);
    state.pending.remove(&event.id);
  }
}

fn start_query_job(state: &mut State, conn: ConnId, job: Box<dyn Job>) {
  let id = state.ids.next_id();
  let handle = state.pool.start(id, job, Priority::Query);
  state.pending.insert(id, Pending { conn, handle });
}

// ============================================================================
// Project registration & ingestion
// ============================================================================

fn handle_project_message(state: &mut State, conn: ConnId, message: ProjectMessage) {
  match message.kind {
    ProjectKind::Makefile => {
      let makefile = message.path.clone();
      let mut args = message.args.clone();
      if message.flags.use_dash_b {
        args.push("-B".to_string());
      }
      state.makefiles.insert(
        makefile.clone(),
        MakefileInfo {
          args: args.clone(),
          extra_flags: message.extra_flags.clone(),
          no_make_tricks: message.flags.no_make_tricks,
        },
      );
      write_projects(state);
      state.watcher.watch(&makefile);

      let added = !state.registry.contains(&makefile);
      if added {
        state
          .registry
          .insert(Project::new(ProjectKind::Makefile, makefile.clone()));
        reply(state, conn, format!("Added project {}", makefile.display()));
        broadcast_log(state, 0, &format!("Added project {}", makefile.display()));
      } else {
        reply(state, conn, format!("{} is already added", makefile.display()));
      }

      let valid = state.registry.get(&makefile).is_some_and(Project::is_valid);
      if added || valid || message.flags.automake {
        start_make(state, &makefile, Some(conn));
      } else {
        reply_finish(state, conn);
      }
    }
    ProjectKind::GrTags => {
      if grtag(state, &message.path) {
        reply(state, conn, format!("Parsing {}", message.path.display()));
      }
      reply_finish(state, conn);
    }
    ProjectKind::Smart => {
      if smart_project(state, &message.path, message.extra_flags.clone(), Some(conn)) {
        reply(state, conn, format!("Parsing {}", message.path.display()));
      } else {
        reply_finish(state, conn);
      }
    }
  }
}

/// Kick off a dry-run ingestion for a registered makefile.
fn start_make(state: &mut State, makefile: &Path, conn: Option<ConnId>) {
  let Some(info) = state.makefiles.get(makefile).cloned() else {
    if let Some(conn) = conn {
      reply_finish(state, conn);
    }
    return;
  };
  if state.ingests.contains_key(makefile) {
    debug!(makefile = %makefile.display(), "ingestion already running");
    if let Some(conn) = conn {
      reply_finish(state, conn);
    }
    return;
  }

  if let Some(project) = state.registry.get(makefile) {
    if let Some(indexer) = &project.indexer {
      indexer.begin_makefile();
    }
  }

  let cancel = CancellationToken::new();
  state.ingests.insert(makefile.to_path_buf(), cancel.clone());
  ingest::start_build_ingest(
    IngestConfig {
      build_tool: state.options.build_tool.clone(),
      makefile: makefile.to_path_buf(),
      args: info.args,
      no_make_tricks: info.no_make_tricks,
      conn,
    },
    state.events.clone(),
    cancel,
  );
}

fn grtag(state: &mut State, dir: &Path) -> bool {
  if state.registry.contains(dir) {
    return false;
  }
  let mut project = Project::new(ProjectKind::GrTags, dir.to_path_buf());
  project.init(
    dir,
    &persist::store_path(&state.options.data_dir, dir),
    state.events.clone(),
  );
  state.registry.insert(project);
  state.grtags.push(dir.to_path_buf());
  write_projects(state);
  state.registry.set_current(dir);
  true
}

fn smart_project(state: &mut State, dir: &Path, extra_flags: Vec<String>, conn: Option<ConnId>) -> bool {
  if state.registry.contains(dir) {
    return false;
  }
  let mut project = Project::new(ProjectKind::Smart, dir.to_path_buf());
  project.init(
    dir,
    &persist::store_path(&state.options.data_dir, dir),
    state.events.clone(),
  );
  if let Some(indexer) = &project.indexer {
    indexer.begin_makefile();
  }
  state.registry.insert(project);
  state.registry.set_current(dir);
  state.smart.insert(dir.to_path_buf(), extra_flags.clone());
  write_projects(state);

  let cancel = CancellationToken::new();
  state.ingests.insert(dir.to_path_buf(), cancel.clone());
  ingest::start_smart_ingest(dir.to_path_buf(), extra_flags, conn, state.events.clone(), cancel);
  true
}

/// One compile command from an ingester: attach it to its project,
/// discovering the source root and restoring from disk on first contact,
/// then schedule a parse job per dirty input.
fn process_source_file(state: &mut State, project_key: &Path, command: CompileCommand) {
  if command.language == Language::None {
    return;
  }
  if command.inputs.is_empty() {
    warn!("compile command without input files");
    return;
  }
  if state.registry.get(project_key).is_none() {
    error!(project = %project_key.display(), "no project for compile command");
    stop_ingest(state, project_key);
    return;
  }

  let data_dir = state.options.data_dir.clone();
  let events = state.events.clone();
  let home = state.home.clone();

  {
    let project = state.registry.get_mut(project_key).expect("checked above");
    if !project.is_valid() {
      let Some(src_root) = find_project_root(&command.inputs[0], &home) else {
        error!(input = %command.inputs[0].display(), "cannot find project root");
        stop_ingest(state, project_key);
        return;
      };
      project.init(&src_root, &persist::store_path(&data_dir, project_key), events);
      if let Some(indexer) = &project.indexer {
        indexer.begin_makefile();
      }
    }
    // Per-project blobs restore lazily, on first contact after startup.
    if !project.restore_attempted {
      project.restore_attempted = true;
      persist::restore_project(&data_dir, project);
    }
  }
  state.registry.set_current(project_key);

  let extra_flags = state
    .makefiles
    .get(project_key)
    .map(|info| info.extra_flags.clone())
    .unwrap_or_default();

  let project = state.registry.get(project_key).expect("checked above");
  let Some(indexer) = project.indexer.clone() else {
    return;
  };

  for input in &command.inputs {
    let file_id = state.paths.intern(input);
    let mut args = command.args.clone();
    args.extend(extra_flags.iter().cloned());
    args.extend(state.default_args.iter().cloned());
    let source = SourceInfo {
      source_file: input.clone(),
      compiler: command.compiler.clone(),
      args,
    };

    if indexer.is_clean(file_id, &source) {
      debug!(file = %input.display(), "not dirty, ignoring");
      continue;
    }
    schedule_index_job(state, &indexer, file_id, source);
  }
}

fn schedule_index_job(state: &mut State, indexer: &Arc<crate::index::Indexer>, file_id: u32, source: SourceInfo) {
  indexer.set_source_info(file_id, source.clone());
  indexer.job_started(&source.source_file);
  let id = state.ids.next_id();
  let job = IndexJob {
    file_id,
    source,
    indexer: Arc::clone(indexer),
    provider: Arc::clone(&state.provider),
    paths: Arc::clone(&state.paths),
  };
  state.pool.start(id, Box::new(job), Priority::Index);
}

fn stop_ingest(state: &mut State, project_key: &Path) {
  if let Some(cancel) = state.ingests.get(project_key) {
    cancel.cancel();
  }
}

fn handle_ingest_done(state: &mut State, project_key: &Path, conn: Option<ConnId>, ok: bool) {
  state.ingests.remove(project_key);
  let sources = state
    .registry
    .get(project_key)
    .and_then(|p| p.indexer.as_ref())
    .map(|indexer| indexer.end_makefile())
    .unwrap_or(0);

  let line = if ok {
    format!("Parsed {}, {} sources", project_key.display(), sources)
  } else {
    format!("Build ingestion failed for {}", project_key.display())
  };
  info!("{}", line);
  broadcast_log(state, 0, &line);
  if let Some(conn) = conn {
    reply(state, conn, line);
    reply_finish(state, conn);
  }
}

fn handle_makefile_modified(state: &mut State, path: &Path) {
  if !state.makefiles.contains_key(path) {
    return;
  }
  let valid = state.registry.get(path).is_some_and(Project::is_valid);
  if valid {
    info!(makefile = %path.display(), "makefile modified, re-ingesting");
    start_make(state, path, None);
  }
}

// ============================================================================
// Projects file
// ============================================================================

fn write_projects(state: &mut State) {
  let mut file = ProjectsFile::default();
  let mut makefiles: Vec<_> = state.makefiles.iter().collect();
  makefiles.sort_by(|a, b| a.0.cmp(b.0));
  file.makefiles = makefiles.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect();
  file.grtags = state.grtags.clone();
  let mut smart: Vec<_> = state.smart.iter().collect();
  smart.sort_by(|a, b| a.0.cmp(b.0));
  file.smart = smart.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect();

  if let Err(e) = file.save(&state.options.projects_file) {
    warn!(path = %state.options.projects_file.display(), error = %e, "cannot write projects file");
  }
  for (makefile, _) in &file.makefiles {
    state.watcher.watch(makefile);
  }
}

fn reload_projects(state: &mut State) {
  state.watcher.clear();
  let file = ProjectsFile::load(&state.options.projects_file);

  let mut previous: Vec<PathBuf> = state.registry.keys();

  state.makefiles.clear();
  for (makefile, info) in file.makefiles {
    state.makefiles.insert(makefile.clone(), info);
    state.watcher.watch(&makefile);
    previous.retain(|p| p != &makefile);
    if !state.registry.contains(&makefile) {
      state.registry.insert(Project::new(ProjectKind::Makefile, makefile));
    }
  }

  state.grtags.clear();
  for dir in file.grtags {
    previous.retain(|p| p != &dir);
    if !state.registry.contains(&dir) {
      grtag(state, &dir);
    } else {
      state.grtags.push(dir);
    }
  }

  state.smart.clear();
  for (dir, flags) in file.smart {
    previous.retain(|p| p != &dir);
    if !state.registry.contains(&dir) {
      smart_project(state, &dir, flags, None);
    } else {
      state.smart.insert(dir, flags);
    }
  }

  for stale in previous {
    remove_project(state, &stale);
  }
  info!(projects = state.registry.len(), "projects loaded");
}

fn remove_project(state: &mut State, key: &Path) {
  if let Some(mut project) = state.registry.remove(key) {
    project.unload();
  }
  let mut write = state.makefiles.remove(key).is_some();
  let before = state.grtags.len();
  state.grtags.retain(|p| p != key);
  write |= state.grtags.len() != before;
  write |= state.smart.remove(key).is_some();
  if write {
    write_projects(state);
  }
}

// ============================================================================
// Queries
// ============================================================================

fn handle_query_message(state: &mut State, conn: ConnId, query: QueryMessage) -> Flow {
  if query.flags.silent {
    state.silent.insert(conn);
  } else {
    state.silent.remove(&conn);
  }
  match query.kind {
    QueryKind::Shutdown => {
      reply(state, conn, "Shutting down");
      reply_finish(state, conn);
      return Flow::Shutdown;
    }
    QueryKind::FollowLocation => follow_location(state, conn, &query),
    QueryKind::CursorInfo => cursor_info(state, conn, &query),
    QueryKind::ReferencesLocation => references_location(state, conn, &query),
    QueryKind::ReferencesName => references_name(state, conn, &query),
    QueryKind::ListSymbols => list_symbols(state, conn, &query),
    QueryKind::FindSymbols => find_symbols(state, conn, &query),
    QueryKind::FindFile => find_file(state, conn, &query),
    QueryKind::DumpFile => dump_file(state, conn, &query),
    QueryKind::Status => status(state, conn),
    QueryKind::IsIndexed => is_indexed(state, conn, &query),
    QueryKind::HasFileManager => has_file_manager(state, conn, &query),
    QueryKind::FixIts => fix_its(state, conn, &query),
    QueryKind::Errors => errors(state, conn, &query),
    QueryKind::Reindex => reindex(state, conn, &query),
    QueryKind::Project => project_query(state, conn, &query),
    QueryKind::DeleteProject => remove_projects_matching(state, conn, &query, false),
    QueryKind::UnloadProject => remove_projects_matching(state, conn, &query, true),
    QueryKind::ReloadProjects => {
      let old = state.registry.len();
      reload_projects(state);
      reply(state, conn, format!("Changed from {} to {} projects", old, state.registry.len()));
      reply_finish(state, conn);
    }
    QueryKind::ClearProjects => {
      clear_projects(state);
      reply(state, conn, "Cleared projects");
      reply_finish(state, conn);
    }
    QueryKind::PreprocessFile => preprocess_file(state, conn, &query),
  }
  Flow::Continue
}

/// Parse the query's location and make its file's project current.
/// Replies finish and returns `None` when the location is unusable.
fn query_location(state: &mut State, conn: ConnId, query: &QueryMessage) -> Option<cnav_store::Location> {
  let Some(location) = parse_location(&query.query, &state.paths) else {
    reply_finish(state, conn);
    return None;
  };
  if let Some(path) = state.paths.path_of(location.file_id) {
    state.registry.update_for_path(&path);
  }
  Some(location)
}

/// The current project's indexer, or an error reply.
fn current_indexer(state: &mut State, conn: ConnId) -> Option<Arc<crate::index::Indexer>> {
  match state.registry.current().and_then(|p| p.indexer.clone()) {
    Some(indexer) => Some(indexer),
    None => {
      error!("no current project");
      reply_finish(state, conn);
      None
    }
  }
}

fn follow_location(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(location) = query_location(state, conn, query) else { return };
  let Some(indexer) = current_indexer(state, conn) else { return };
  start_query_job(
    state,
    conn,
    Box::new(FollowLocationJob {
      location,
      stores: Arc::clone(indexer.stores()),
      paths: Arc::clone(&state.paths),
    }),
  );
}

fn cursor_info(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(location) = query_location(state, conn, query) else { return };
  let Some(indexer) = current_indexer(state, conn) else { return };
  start_query_job(
    state,
    conn,
    Box::new(CursorInfoJob {
      location,
      stores: Arc::clone(indexer.stores()),
      paths: Arc::clone(&state.paths),
    }),
  );
}

fn references_location(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(location) = query_location(state, conn, query) else { return };
  let Some(indexer) = current_indexer(state, conn) else { return };
  start_query_job(
    state,
    conn,
    Box::new(ReferencesJob {
      query: ReferencesQuery::Location(location),
      stores: Arc::clone(indexer.stores()),
      paths: Arc::clone(&state.paths),
    }),
  );
}

fn references_name(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(indexer) = current_indexer(state, conn) else { return };
  start_query_job(
    state,
    conn,
    Box::new(ReferencesJob {
      query: ReferencesQuery::Name(query.query.clone()),
      stores: Arc::clone(indexer.stores()),
      paths: Arc::clone(&state.paths),
    }),
  );
}

fn list_symbols(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(indexer) = current_indexer(state, conn) else { return };
  start_query_job(
    state,
    conn,
    Box::new(ListSymbolsJob {
      partial: query.query.clone(),
      stores: Arc::clone(indexer.stores()),
    }),
  );
}

fn find_symbols(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(indexer) = current_indexer(state, conn) else { return };
  start_query_job(
    state,
    conn,
    Box::new(FindSymbolsJob {
      name: query.query.clone(),
      stores: Arc::clone(indexer.stores()),
      paths: Arc::clone(&state.paths),
    }),
  );
}

fn find_file(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(project) = state.registry.current() else {
    error!("no current project");
    reply_finish(state, conn);
    return;
  };
  let regex = if query.flags.match_regexp {
    Regex::new(&query.query).ok()
  } else {
    None
  };
  let files = project.file_manager.matching("", None);
  start_query_job(
    state,
    conn,
    Box::new(FindFileJob {
      pattern: query.query.clone(),
      regex,
      files,
    }),
  );
}

fn dump_file(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let path = PathBuf::from(&query.query);
  let path = path.canonicalize().unwrap_or(path);
  let not_indexed = |state: &State| {
    reply(state, conn, format!("{} is not indexed", query.query));
    reply_finish(state, conn);
  };
  let Some(file_id) = state.paths.get(&path) else {
    not_indexed(state);
    return;
  };
  state.registry.update_for_path(&path);
  let Some(indexer) = state.registry.current().and_then(|p| p.indexer.clone()) else {
    not_indexed(state);
    return;
  };
  if indexer.source_info(file_id).is_none() {
    not_indexed(state);
    return;
  }
  start_query_job(
    state,
    conn,
    Box::new(DumpFileJob {
      file_id,
      stores: Arc::clone(indexer.stores()),
      paths: Arc::clone(&state.paths),
    }),
  );
}

fn status(state: &mut State, conn: ConnId) {
  let Some(project) = state.registry.current() else {
    error!("no current project");
    reply_finish(state, conn);
    return;
  };
  let Some(indexer) = project.indexer.clone() else {
    reply_finish(state, conn);
    return;
  };
  start_query_job(
    state,
    conn,
    Box::new(StatusJob {
      project: project.path.clone(),
      src_root: project.src_root().map(Path::to_path_buf),
      source_count: indexer.source_count(),
      file_count: project.file_manager.len(),
      stores: Arc::clone(indexer.stores()),
    }),
  );
}

fn is_indexed(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let path = PathBuf::from(&query.query);
  let path = path.canonicalize().unwrap_or(path);

  // The current project is probed, not changed, by this query.
  let saved = state.registry.current_key().map(Path::to_path_buf);
  let mut answer = false;

  if path.is_file() {
    if let Some(file_id) = state.paths.get(&path) {
      state.registry.update_for_path(&path);
      answer = state.registry.current().is_some_and(|p| p.is_indexed(file_id));
    }
  } else if path.is_dir() {
    state.registry.update_for_path(&path);
    answer = state.registry.current().is_some_and(|p| p.file_manager.contains(&path));
  }

  if let Some(saved) = saved {
    state.registry.set_current(&saved);
  }
  reply(state, conn, if answer { "1" } else { "0" });
  reply_finish(state, conn);
}

fn has_file_manager(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let path = PathBuf::from(&query.query);
  let path = path.canonicalize().unwrap_or(path);
  state.registry.update_for_path(&path);
  let answer = state
    .registry
    .current()
    .is_some_and(|p| p.file_manager.contains(&path));
  reply(state, conn, if answer { "1" } else { "0" });
  reply_finish(state, conn);
}

fn fix_its(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(indexer) = current_indexer(state, conn) else { return };
  let path = PathBuf::from(&query.query);
  let path = path.canonicalize().unwrap_or(path);
  if let Some(file_id) = state.paths.get(&path) {
    let out = indexer.fix_its(file_id);
    if !out.is_empty() {
      reply(state, conn, out);
    }
  }
  reply_finish(state, conn);
}

fn errors(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(indexer) = current_indexer(state, conn) else { return };
  let file_id = if query.query.is_empty() {
    None
  } else {
    let path = PathBuf::from(&query.query);
    let path = path.canonicalize().unwrap_or(path);
    state.paths.get(&path)
  };
  let out = indexer.errors(file_id);
  if !out.is_empty() {
    reply(state, conn, out);
  }
  reply_finish(state, conn);
}

fn reindex(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let Some(indexer) = current_indexer(state, conn) else { return };
  let matched = indexer.reindex(&query.query, query.flags.match_regexp, &state.paths);
  if matched.is_empty() {
    reply(state, conn, "No matches");
  } else {
    reply(state, conn, format!("Dirtied {} files", matched.len()));
  }
  for (file_id, source) in matched {
    schedule_index_job(state, &indexer, file_id, source);
  }
  reply_finish(state, conn);
}

fn project_query(state: &mut State, conn: ConnId, query: &QueryMessage) {
  if query.query.is_empty() {
    let current = state.registry.current_key().map(Path::to_path_buf);
    let lines: Vec<String> = state
      .registry
      .iter()
      .map(|project| {
        format!(
          "{}{}{}",
          project.path.display(),
          if project.is_valid() { " (loaded)" } else { "" },
          if current.as_deref() == Some(&project.path) { " <=" } else { "" }
        )
      })
      .collect();
    for line in lines {
      reply(state, conn, line);
    }
    reply_finish(state, conn);
    return;
  }

  let as_path = PathBuf::from(&query.query);
  if as_path.exists() && state.registry.update_for_path(&as_path) {
    let selected = state.registry.current_key().map(Path::to_path_buf).unwrap_or_default();
    reply(
      state,
      conn,
      format!("Selected project: {} for {}", selected.display(), query.query),
    );
    reply_finish(state, conn);
    return;
  }

  let Ok(regex) = Regex::new(&query.query) else {
    reply(state, conn, format!("No matches for {}", query.query));
    reply_finish(state, conn);
    return;
  };
  let mut matches: Vec<PathBuf> = Vec::new();
  for project in state.registry.iter() {
    let candidates = [
      Some(project.path.as_path()),
      project.src_root(),
      project.resolved_src_root(),
    ];
    if candidates
      .into_iter()
      .flatten()
      .any(|p| regex.is_match(&p.to_string_lossy()))
    {
      matches.push(project.path.clone());
    }
  }

  match matches.as_slice() {
    [] => reply(state, conn, format!("No matches for {}", query.query)),
    [only] => {
      let only = only.clone();
      state.registry.set_current(&only);
      reply(
        state,
        conn,
        format!("Selected project: {} for {}", only.display(), query.query),
      );
    }
    many => {
      reply(state, conn, format!("Multiple matches for {}", query.query));
      for key in many {
        reply(state, conn, key.display().to_string());
      }
    }
  }
  reply_finish(state, conn);
}

fn remove_projects_matching(state: &mut State, conn: ConnId, query: &QueryMessage, unload: bool) {
  let Ok(regex) = Regex::new(&query.query) else {
    reply_finish(state, conn);
    return;
  };
  let targets: Vec<PathBuf> = state
    .registry
    .keys()
    .into_iter()
    .filter(|key| regex.is_match(&key.to_string_lossy()))
    .collect();

  for key in targets {
    reply(
      state,
      conn,
      format!("{} project: {}", if unload { "Unloaded" } else { "Deleted" }, key.display()),
    );
    if unload {
      if state.registry.current_key() == Some(key.as_path()) {
        state.registry.clear_current();
      }
      if let Some(project) = state.registry.get_mut(&key) {
        project.unload();
      }
    } else {
      let _ = std::fs::remove_file(persist::project_blob_path(&state.options.data_dir, &key));
      let _ = std::fs::remove_file(persist::store_path(&state.options.data_dir, &key));
      remove_project(state, &key);
    }
  }
  reply_finish(state, conn);
}

fn clear_projects(state: &mut State) {
  let keys = state.registry.keys();
  for key in keys {
    if let Some(mut project) = state.registry.remove(&key) {
      project.unload();
    }
  }
  state.makefiles.clear();
  state.grtags.clear();
  state.smart.clear();
  state.watcher.clear();
  let _ = std::fs::remove_dir_all(&state.options.data_dir);
  let _ = std::fs::create_dir_all(&state.options.data_dir);
  write_projects(state);
}

fn preprocess_file(state: &mut State, conn: ConnId, query: &QueryMessage) {
  let path = PathBuf::from(&query.query);
  let path = path.canonicalize().unwrap_or(path);
  state.registry.update_for_path(&path);
  let Some(indexer) = state.registry.current().and_then(|p| p.indexer.clone()) else {
    reply(state, conn, "No project");
    reply_finish(state, conn);
    return;
  };
  let source = state.paths.get(&path).and_then(|file_id| indexer.source_info(file_id));
  let Some(source) = source else {
    reply(state, conn, format!("No arguments for {}", query.query));
    reply_finish(state, conn);
    return;
  };
  start_query_job(
    state,
    conn,
    Box::new(PreprocessJob {
      source,
      provider: Arc::clone(&state.provider),
    }),
  );
}

// ============================================================================
// Persistence & teardown
// ============================================================================

fn fire_save_timers(state: &mut State) {
  let due = state.timers.take_due(Instant::now());
  for key in due {
    if let Some(project) = state.registry.get(&key) {
      if project.is_valid() {
        persist::save_project(&state.options.data_dir, project, &state.paths);
        broadcast_log(state, 1, &format!("Saved project {}", key.display()));
      }
    }
  }
}

fn teardown(state: State) {
  info!("shutting down");
  let State {
    options,
    pool,
    mut registry,
    ..
  } = state;

  pool.clear_backlog();
  pool.shutdown();
  for project in registry.iter_mut() {
    project.unload();
  }
  let _ = std::fs::remove_file(&options.socket_path);
  info!("shutdown complete");
}
