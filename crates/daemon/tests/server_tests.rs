//! End-to-end tests: a real daemon on a temp socket, driven through the
//! IPC client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use cnav_daemon::{Options, Server};
use cnav_frontend::SitterProvider;
use cnav_ipc::{Client, Message, ProjectFlags, ProjectKind, ProjectMessage, QueryKind, QueryMessage};

struct TestDaemon {
  options: Options,
  handle: JoinHandle<()>,
  _dir: tempfile::TempDir,
}

impl TestDaemon {
  async fn start() -> Self {
    let dir = tempfile::tempdir().unwrap();
    Self::start_in(dir).await
  }

  async fn start_in(dir: tempfile::TempDir) -> Self {
    let options = Options {
      socket_path: dir.path().join("cnavd.sock"),
      data_dir: dir.path().join("data"),
      projects_file: dir.path().join("projects"),
      thread_count: 2,
      default_args: Vec::new(),
      no_builtin_include: true,
      no_wall: true,
      clear_projects: false,
      build_tool: "make".to_string(),
    };
    let server = Server::new(options.clone(), Arc::new(SitterProvider::new()));
    let handle = tokio::spawn(async move {
      let _ = server.run().await;
    });

    // Wait for the socket to come up.
    for _ in 0..100 {
      if Client::connect(&options.socket_path).await.is_ok() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Self {
      options,
      handle,
      _dir: dir,
    }
  }

  async fn client(&self) -> Client {
    Client::connect(&self.options.socket_path).await.expect("daemon reachable")
  }

  async fn query(&self, kind: QueryKind, query: impl Into<String>) -> Vec<String> {
    let mut client = self.client().await;
    client.query(QueryMessage::new(kind, query)).await.expect("query answered")
  }

  async fn add_smart_project(&self, dir: &Path) -> Vec<String> {
    let mut client = self.client().await;
    client
      .send(&Message::Project(ProjectMessage {
        kind: ProjectKind::Smart,
        path: dir.to_path_buf(),
        args: Vec::new(),
        extra_flags: Vec::new(),
        flags: ProjectFlags::default(),
      }))
      .await
      .unwrap();
    client.collect_responses().await.unwrap()
  }

  async fn shutdown(self) {
    let lines = self.query(QueryKind::Shutdown, "").await;
    assert_eq!(lines, vec!["Shutting down".to_string()]);
    let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
  }
}

/// A two-file tree: `a.c` calls a function defined in `b.h`.
fn write_tree(root: &Path) -> (PathBuf, PathBuf) {
  std::fs::create_dir_all(root).unwrap();
  let header = root.join("b.h");
  std::fs::write(&header, "int helper(int x) {\n  return x;\n}\n").unwrap();
  let source = root.join("a.c");
  std::fs::write(&source, "#include \"b.h\"\n\nint main(void) {\n  return helper(3);\n}\n").unwrap();
  (source.canonicalize().unwrap(), header.canonicalize().unwrap())
}

/// Retry a query until `check` passes or the deadline runs out.
async fn poll_query(
  daemon: &TestDaemon,
  kind: QueryKind,
  query: &str,
  check: impl Fn(&[String]) -> bool,
) -> Vec<String> {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
  loop {
    let lines = daemon.query(kind, query).await;
    if check(&lines) {
      return lines;
    }
    if tokio::time::Instant::now() > deadline {
      panic!("query {:?} {:?} never converged; last answer: {:?}", kind, query, lines);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
  }
}

#[tokio::test]
async fn test_add_project_and_follow_location() {
  let daemon = TestDaemon::start().await;
  let tree = daemon._dir.path().join("tree");
  let (source, header) = write_tree(&tree);

  let lines = daemon.add_smart_project(&tree).await;
  assert!(lines.iter().any(|l| l.starts_with("Parsing")), "got {:?}", lines);

  // The call site in a.c resolves to the definition in b.h.
  let spec = format!("{}:4:10", source.display());
  let lines = poll_query(&daemon, QueryKind::FollowLocation, &spec, |lines| !lines.is_empty()).await;
  assert_eq!(lines, vec![format!("{}:1:5", header.display())]);

  let lines = daemon.query(QueryKind::IsIndexed, source.to_string_lossy()).await;
  assert_eq!(lines, vec!["1".to_string()]);

  daemon.shutdown().await;
}

#[tokio::test]
async fn test_references_and_symbol_queries() {
  let daemon = TestDaemon::start().await;
  let tree = daemon._dir.path().join("tree");
  let (source, _header) = write_tree(&tree);
  daemon.add_smart_project(&tree).await;

  // The definition's reference set must list the call site in a.c.
  let call_site = format!("{}:4:10", source.display());
  let lines = poll_query(&daemon, QueryKind::ReferencesName, "helper", |lines| !lines.is_empty()).await;
  assert!(lines.contains(&call_site), "references {:?} missing {}", lines, call_site);

  let lines = daemon.query(QueryKind::ListSymbols, "help").await;
  assert!(lines.contains(&"helper".to_string()), "symbols: {:?}", lines);

  let lines = daemon.query(QueryKind::FindSymbols, "main").await;
  assert!(lines.iter().any(|l| l.contains("a.c")), "main locations: {:?}", lines);

  daemon.shutdown().await;
}

#[tokio::test]
async fn test_project_selection_by_pattern() {
  let daemon = TestDaemon::start().await;
  let alpha = daemon._dir.path().join("alpha");
  let bravo = daemon._dir.path().join("bravo");
  write_tree(&alpha);
  write_tree(&bravo);
  daemon.add_smart_project(&alpha).await;
  daemon.add_smart_project(&bravo).await;

  let lines = daemon.query(QueryKind::Project, "alph").await;
  assert!(
    lines.iter().any(|l| l.starts_with("Selected project:") && l.contains("alpha")),
    "got {:?}",
    lines
  );

  // The listing marks the selection as current.
  let lines = daemon.query(QueryKind::Project, "").await;
  let current: Vec<&String> = lines.iter().filter(|l| l.ends_with("<=")).collect();
  assert_eq!(current.len(), 1);
  assert!(current[0].contains("alpha"), "got {:?}", lines);

  daemon.shutdown().await;
}

#[tokio::test]
async fn test_is_indexed_unknown_file_and_has_file_manager() {
  let daemon = TestDaemon::start().await;
  let tree = daemon._dir.path().join("tree");
  let (source, _header) = write_tree(&tree);
  daemon.add_smart_project(&tree).await;

  poll_query(&daemon, QueryKind::IsIndexed, &source.to_string_lossy(), |lines| {
    lines.len() == 1 && lines[0] == "1"
  })
  .await;

  let lines = daemon.query(QueryKind::IsIndexed, "/no/such/file.c").await;
  assert_eq!(lines, vec!["0".to_string()]);

  let lines = daemon
    .query(QueryKind::HasFileManager, tree.canonicalize().unwrap().to_string_lossy())
    .await;
  assert_eq!(lines, vec!["1".to_string()]);

  daemon.shutdown().await;
}

#[tokio::test]
async fn test_restart_restores_index_from_disk() {
  let dir = tempfile::tempdir().unwrap();
  let tree = dir.path().join("tree");
  let (source, header) = write_tree(&tree);

  let daemon = TestDaemon::start_in(dir).await;
  daemon.add_smart_project(&tree).await;

  let spec = format!("{}:4:10", source.display());
  poll_query(&daemon, QueryKind::FollowLocation, &spec, |lines| !lines.is_empty()).await;

  // Wait for the quiescence save to land on disk.
  let blob_dir = daemon.options.data_dir.clone();
  let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
  loop {
    let saved = std::fs::read_dir(&blob_dir)
      .map(|entries| entries.flatten().any(|e| e.path().is_file() && e.file_name() != "paths"))
      .unwrap_or(false);
    if saved && blob_dir.join("paths").is_file() {
      break;
    }
    assert!(tokio::time::Instant::now() < deadline, "save timer never fired");
    tokio::time::sleep(Duration::from_millis(250)).await;
  }

  // Stop the first daemon; its data directory stays behind.
  let mut client = daemon.client().await;
  client.query(QueryMessage::new(QueryKind::Shutdown, "")).await.unwrap();
  let TestDaemon { options, handle, _dir } = daemon;
  let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

  // A fresh daemon over the same data directory serves the stored index
  // after re-registering the project.
  let server = Server::new(options.clone(), Arc::new(SitterProvider::new()));
  let handle = tokio::spawn(async move {
    let _ = server.run().await;
  });
  for _ in 0..100 {
    if Client::connect(&options.socket_path).await.is_ok() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  let restarted = TestDaemon { options, handle, _dir };

  poll_query(&restarted, QueryKind::IsIndexed, &source.to_string_lossy(), |lines| {
    lines.len() == 1 && lines[0] == "1"
  })
  .await;
  let lines = poll_query(&restarted, QueryKind::FollowLocation, &spec, |lines| !lines.is_empty()).await;
  assert_eq!(lines, vec![format!("{}:1:5", header.display())]);

  restarted.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_answers_while_work_is_queued() {
  let daemon = TestDaemon::start().await;
  let tree = daemon._dir.path().join("tree");
  std::fs::create_dir_all(&tree).unwrap();
  for i in 0..50 {
    std::fs::write(tree.join(format!("f{}.c", i)), format!("int f{}(void) {{ return {}; }}\n", i, i)).unwrap();
  }
  daemon.add_smart_project(&tree).await;

  // Shutdown must be answered promptly even with parse jobs in flight.
  let start = std::time::Instant::now();
  daemon.shutdown().await;
  assert!(start.elapsed() < Duration::from_secs(5), "shutdown took {:?}", start.elapsed());
}
