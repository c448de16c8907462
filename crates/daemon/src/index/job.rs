//! The parse job: one translation unit through the provider, deltas into
//! the staging buffer.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use cnav_frontend::{ParseError, ParsedUnit, TranslationUnitProvider};
use cnav_store::{FileId, FileInformation, PathTable, SourceInfo};

use crate::{
  index::Indexer,
  pool::{Job, JobContext},
};

pub struct IndexJob {
  pub file_id: FileId,
  pub source: SourceInfo,
  pub indexer: Arc<Indexer>,
  pub provider: Arc<dyn TranslationUnitProvider>,
  pub paths: Arc<PathTable>,
}

impl Job for IndexJob {
  fn run(&mut self, ctx: &JobContext) {
    if !ctx.aborted() {
      match self.provider.parse(&self.source, &self.paths, ctx.abort_flag()) {
        Ok(unit) => self.merge(unit),
        // A cancelled job finishes silently with no output.
        Err(ParseError::Aborted) => debug!(file = %self.source.source_file.display(), "parse aborted"),
        Err(e) => {
          warn!(file = %self.source.source_file.display(), error = %e, "parse failed");
          self
            .indexer
            .set_diagnostics(self.file_id, vec![format!("{}: error: {}", self.source.source_file.display(), e)]);
        }
      }
    }
    self.indexer.job_finished();
  }
}

impl IndexJob {
  fn merge(&self, unit: ParsedUnit) {
    let writer = self.indexer.writer();
    writer.add_symbol_names(unit.symbol_names);
    writer.add_references(unit.references);
    writer.add_symbols(unit.symbols);
    writer.add_dependencies(unit.dependencies);
    if !unit.pch_dependencies.is_empty() {
      writer.set_pch_dependencies(unit.pch_dependencies);
    }

    // Diagnostics and fix-its stay in memory, grouped per file.
    let mut by_file: std::collections::HashMap<FileId, Vec<String>> = std::collections::HashMap::new();
    for diagnostic in &unit.diagnostics {
      let path = self
        .paths
        .path_of(diagnostic.file_id)
        .unwrap_or_else(|| self.source.source_file.clone());
      by_file.entry(diagnostic.file_id).or_default().push(format!(
        "{}:{}:{}: {}: {}",
        path.display(),
        diagnostic.line,
        diagnostic.column,
        diagnostic.severity,
        diagnostic.message
      ));
    }
    self.indexer.set_diagnostics(self.file_id, by_file.remove(&self.file_id).unwrap_or_default());
    for (file, lines) in by_file {
      self.indexer.set_diagnostics(file, lines);
    }
    for (file, fix_its) in unit.fix_its {
      self.indexer.set_fix_its(file, fix_its);
    }

    let last_touched = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or_default();
    writer.add_file_information(
      self.file_id,
      FileInformation {
        args: self.source.args.clone(),
        last_touched,
      },
    );
  }
}
