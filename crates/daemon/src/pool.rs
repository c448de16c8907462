//! The shared worker pool.
//!
//! Indexing and query jobs run on one fixed set of OS threads so an
//! interactive lookup can overtake a tree-wide reindex: scheduling is
//! priority-ordered, FIFO within a priority. Cancellation is cooperative;
//! every job owns an abort flag it is expected to check between units of
//! work. Job output is posted to the dispatcher loop as [`JobEvent`]s
//! rather than written anywhere directly.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

use crate::event::{JobEvent, ServerEvent};

/// Non-zero, strictly increasing (with wrap) job id. See
/// [`JobIdGenerator`].
pub type JobId = u32;

/// Queue priorities; higher values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
  Index = 0,
  Query = 1,
}

/// A discrete unit of work. `run` blocks a worker thread; implementations
/// check [`JobContext::aborted`] at every loop iteration and between
/// output events.
pub trait Job: Send {
  fn run(&mut self, ctx: &JobContext);
}

/// Handed to a job while it runs.
pub struct JobContext {
  id: JobId,
  aborted: Arc<AtomicBool>,
  events: UnboundedSender<ServerEvent>,
}

impl JobContext {
  pub fn id(&self) -> JobId {
    self.id
  }

  pub fn aborted(&self) -> bool {
    self.aborted.load(Ordering::Relaxed)
  }

  /// The raw flag, for collaborators that poll it themselves (the parser
  /// frontend takes an `&AtomicBool`).
  pub fn abort_flag(&self) -> &AtomicBool {
    &self.aborted
  }

  /// Emit one output line toward the job's connection.
  pub fn write(&self, out: impl Into<String>) {
    let _ = self.events.send(ServerEvent::Job(JobEvent {
      id: self.id,
      out: Some(out.into()),
      finish: false,
    }));
  }
}

/// Cancellation handle kept by the dispatcher in its pending-lookups table.
#[derive(Clone, Debug)]
pub struct JobHandle {
  aborted: Arc<AtomicBool>,
}

impl JobHandle {
  pub fn abort(&self) {
    self.aborted.store(true, Ordering::Relaxed);
  }

  pub fn is_aborted(&self) -> bool {
    self.aborted.load(Ordering::Relaxed)
  }
}

// ============================================================================
// Queue internals
// ============================================================================

struct Queued {
  priority: Priority,
  seq: u64,
  id: JobId,
  aborted: Arc<AtomicBool>,
  job: Box<dyn Job>,
}

impl PartialEq for Queued {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.seq == other.seq
  }
}
impl Eq for Queued {}
impl PartialOrd for Queued {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for Queued {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

struct Inner {
  queue: BinaryHeap<Queued>,
  running: HashMap<JobId, Arc<AtomicBool>>,
  next_seq: u64,
  stopped: bool,
}

struct Shared {
  inner: Mutex<Inner>,
  cond: Condvar,
  events: UnboundedSender<ServerEvent>,
}

// ============================================================================
// JobPool
// ============================================================================

pub struct JobPool {
  shared: Arc<Shared>,
  workers: Vec<JoinHandle<()>>,
}

impl JobPool {
  pub fn new(threads: usize, events: UnboundedSender<ServerEvent>) -> Self {
    let threads = threads.max(1);
    let shared = Arc::new(Shared {
      inner: Mutex::new(Inner {
        queue: BinaryHeap::new(),
        running: HashMap::new(),
        next_seq: 0,
        stopped: false,
      }),
      cond: Condvar::new(),
      events,
    });

    let workers = (0..threads)
      .map(|i| {
        let shared = Arc::clone(&shared);
        std::thread::Builder::new()
          .name(format!("cnav-worker-{}", i))
          .spawn(move || worker_loop(shared))
          .expect("failed to spawn worker thread")
      })
      .collect();

    debug!(threads, "job pool started");
    Self { shared, workers }
  }

  /// Queue a job. The returned handle aborts it whether it is still queued
  /// or already running.
  pub fn start(&self, id: JobId, job: Box<dyn Job>, priority: Priority) -> JobHandle {
    let aborted = Arc::new(AtomicBool::new(false));
    let handle = JobHandle {
      aborted: Arc::clone(&aborted),
    };
    {
      let mut inner = self.shared.inner.lock();
      if inner.stopped {
        warn!(id, "job submitted after pool shutdown");
        return handle;
      }
      let seq = inner.next_seq;
      inner.next_seq += 1;
      inner.queue.push(Queued {
        priority,
        seq,
        id,
        aborted,
        job,
      });
    }
    self.shared.cond.notify_one();
    handle
  }

  /// Drop every queued job. Running jobs are left alone.
  pub fn clear_backlog(&self) {
    let dropped = {
      let mut inner = self.shared.inner.lock();
      let n = inner.queue.len();
      inner.queue.clear();
      n
    };
    if dropped > 0 {
      debug!(dropped, "cleared job backlog");
    }
  }

  /// Stop accepting work, abort running jobs, and join the workers.
  pub fn shutdown(mut self) {
    {
      let mut inner = self.shared.inner.lock();
      inner.stopped = true;
      inner.queue.clear();
      for aborted in inner.running.values() {
        aborted.store(true, Ordering::Relaxed);
      }
    }
    self.shared.cond.notify_all();
    for worker in self.workers.drain(..) {
      let _ = worker.join();
    }
    debug!("job pool stopped");
  }
}

fn worker_loop(shared: Arc<Shared>) {
  loop {
    let queued = {
      let mut inner = shared.inner.lock();
      loop {
        if inner.stopped {
          return;
        }
        if let Some(queued) = inner.queue.pop() {
          inner.running.insert(queued.id, Arc::clone(&queued.aborted));
          break queued;
        }
        shared.cond.wait(&mut inner);
      }
    };

    let Queued {
      id, aborted, mut job, ..
    } = queued;
    trace!(id, "job starting");

    let ctx = JobContext {
      id,
      aborted,
      events: shared.events.clone(),
    };
    job.run(&ctx);

    // Every job ends with a finish event; for an already-forgotten job the
    // dispatcher treats it as a no-op.
    let _ = shared.events.send(ServerEvent::Job(JobEvent {
      id,
      out: None,
      finish: true,
    }));

    shared.inner.lock().running.remove(&id);
    trace!(id, "job finished");
  }
}

// ============================================================================
// Job id generation
// ============================================================================

/// Post-increment counter that skips zero on wrap; the dispatcher keys its
/// pending-lookups table with these.
#[derive(Debug, Default)]
pub struct JobIdGenerator {
  next: JobId,
}

impl JobIdGenerator {
  pub fn next_id(&mut self) -> JobId {
    self.next = self.next.wrapping_add(1);
    if self.next == 0 {
      self.next = self.next.wrapping_add(1);
    }
    self.next
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  struct FnJob<F: FnMut(&JobContext) + Send>(F);
  impl<F: FnMut(&JobContext) + Send> Job for FnJob<F> {
    fn run(&mut self, ctx: &JobContext) {
      (self.0)(ctx)
    }
  }

  fn drain_finishes(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEvent>, expected: usize) {
    let mut seen = 0;
    while seen < expected {
      match rx.blocking_recv() {
        Some(ServerEvent::Job(JobEvent { finish: true, .. })) => seen += 1,
        Some(_) => {}
        None => panic!("event channel closed early"),
      }
    }
  }

  #[test]
  fn test_jobs_run_and_emit_finish() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let pool = JobPool::new(2, tx);
    let ran = Arc::new(AtomicUsize::new(0));
    for i in 0..4u32 {
      let ran = Arc::clone(&ran);
      pool.start(
        i + 1,
        Box::new(FnJob(move |_ctx: &JobContext| {
          ran.fetch_add(1, Ordering::SeqCst);
        })),
        Priority::Index,
      );
    }
    drain_finishes(&mut rx, 4);
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    pool.shutdown();
  }

  #[test]
  fn test_query_priority_overtakes_index_backlog() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    // One worker so queue order is observable.
    let pool = JobPool::new(1, tx);
    let order = Arc::new(Mutex::new(Vec::new()));

    // A blocker keeps the worker busy while we fill the queue.
    let gate = Arc::new(AtomicBool::new(false));
    {
      let gate = Arc::clone(&gate);
      pool.start(
        99,
        Box::new(FnJob(move |_ctx: &JobContext| {
          while !gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
          }
        })),
        Priority::Query,
      );
    }

    for (id, priority) in [(1, Priority::Index), (2, Priority::Index), (3, Priority::Query)] {
      let order = Arc::clone(&order);
      pool.start(
        id,
        Box::new(FnJob(move |ctx: &JobContext| {
          order.lock().push(ctx.id());
        })),
        priority,
      );
    }
    gate.store(true, Ordering::SeqCst);

    drain_finishes(&mut rx, 4);
    assert_eq!(*order.lock(), vec![3, 1, 2]);
    pool.shutdown();
  }

  #[test]
  fn test_abort_handle_observed_by_running_job() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let pool = JobPool::new(1, tx);
    let started = Arc::new(AtomicBool::new(false));
    let handle = {
      let started = Arc::clone(&started);
      pool.start(
        1,
        Box::new(FnJob(move |ctx: &JobContext| {
          started.store(true, Ordering::SeqCst);
          while !ctx.aborted() {
            std::thread::sleep(Duration::from_millis(1));
          }
        })),
        Priority::Query,
      )
    };
    while !started.load(Ordering::SeqCst) {
      std::thread::sleep(Duration::from_millis(1));
    }
    handle.abort();
    drain_finishes(&mut rx, 1);
    pool.shutdown();
  }

  #[test]
  fn test_clear_backlog_drops_queued_jobs() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let pool = JobPool::new(1, tx);
    let gate = Arc::new(AtomicBool::new(false));
    {
      let gate = Arc::clone(&gate);
      pool.start(
        1,
        Box::new(FnJob(move |_ctx: &JobContext| {
          while !gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
          }
        })),
        Priority::Query,
      );
    }
    let ran = Arc::new(AtomicUsize::new(0));
    for id in 2..10u32 {
      let ran = Arc::clone(&ran);
      pool.start(
        id,
        Box::new(FnJob(move |_ctx: &JobContext| {
          ran.fetch_add(1, Ordering::SeqCst);
        })),
        Priority::Index,
      );
    }
    pool.clear_backlog();
    gate.store(true, Ordering::SeqCst);
    drain_finishes(&mut rx, 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    pool.shutdown();
  }

  #[test]
  fn test_job_ids_skip_zero_and_increase() {
    let mut generator = JobIdGenerator::default();
    assert_eq!(generator.next_id(), 1);
    assert_eq!(generator.next_id(), 2);

    let mut wrapped = JobIdGenerator { next: u32::MAX };
    assert_eq!(wrapped.next_id(), 1);
  }
}
