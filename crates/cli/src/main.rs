//! cnavd - the cnav indexing daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use cnav_daemon::{Options, Server};
use cnav_frontend::SitterProvider;

mod logging;

#[derive(Parser)]
#[command(name = "cnavd")]
#[command(about = "C/C++ indexing daemon answering code-navigation queries over a local socket")]
struct Cli {
  /// Path of the Unix socket to listen on
  #[arg(long)]
  socket_path: Option<PathBuf>,
  /// Directory for the persistent indices
  #[arg(long)]
  data_dir: Option<PathBuf>,
  /// Registered-projects file
  #[arg(long)]
  projects_file: Option<PathBuf>,
  /// Worker threads (default: one per CPU)
  #[arg(short = 'j', long, default_value_t = 0)]
  thread_count: usize,
  /// Extra compiler argument appended to every compile command (repeatable)
  #[arg(short = 'a', long = "default-arg")]
  default_args: Vec<String>,
  /// Do not add the built-in system include path
  #[arg(long)]
  no_builtin_include: bool,
  /// Do not add -Wall
  #[arg(long)]
  no_wall: bool,
  /// Wipe all stored projects and indices at startup
  #[arg(long)]
  clear_projects: bool,
  /// Build tool invoked in dry-run mode for makefile projects
  #[arg(long, default_value = "make")]
  build_tool: String,
}

impl Cli {
  fn into_options(self) -> Options {
    let defaults = Options::default();
    Options {
      socket_path: self.socket_path.unwrap_or(defaults.socket_path),
      data_dir: self.data_dir.unwrap_or(defaults.data_dir),
      projects_file: self.projects_file.unwrap_or(defaults.projects_file),
      thread_count: self.thread_count,
      default_args: self.default_args,
      no_builtin_include: self.no_builtin_include,
      no_wall: self.no_wall,
      clear_projects: self.clear_projects,
      build_tool: self.build_tool,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let options = Cli::parse().into_options();
  let _guard = logging::init_logging(&options.data_dir);

  let provider = Arc::new(SitterProvider::new());
  let server = Server::new(options, provider);
  if let Err(e) = server.run().await {
    error!(error = %e, "daemon failed");
    std::process::exit(1);
  }
  Ok(())
}
