use crate::barrier::WaitGroup;
use crate::job::{resolve_chain, run_step, Job, JobFuture, Outcome};
use crate::pool::WorkerPool;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_SENTRY_ID: AtomicU64 = AtomicU64::new(0);
}

struct SentryState<R> {
  id: u64,
  results: Mutex<Vec<Option<R>>>,
  pending: WaitGroup,
}

impl<R> SentryState<R> {
  fn record(&self, terminal: Option<R>) {
    self.results.lock().push(terminal);
    self.pending.done();
  }
}

/// Tracks the fully resolved results of the jobs guarded through it.
///
/// A sentry is independent of every other sentry and of unguarded work on
/// the same pool: `wait` only waits for the jobs passed to `guard` on this
/// sentry (or its clones).
pub struct Sentry<R: Send + 'static> {
  pool: WorkerPool<R>,
  state: Arc<SentryState<R>>,
}

impl<R: Send + 'static> Clone for Sentry<R> {
  fn clone(&self) -> Self {
    Self {
      pool: self.pool.clone(),
      state: self.state.clone(),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for Sentry<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Sentry")
      .field("id", &self.state.id)
      .field("pool_name", &self.pool.name())
      .field("pending", &self.state.pending.count())
      .finish_non_exhaustive()
  }
}

impl<R: Clone + Send + 'static> WorkerPool<R> {
  /// Creates a sentry over this pool, or `None` if the pool is not live.
  pub fn new_sentry(&self) -> Option<Sentry<R>> {
    if !self.is_live() {
      debug!(pool_name = %self.name(), "New sentry requested on a pool that is not live.");
      return None;
    }

    let id = NEXT_SENTRY_ID.fetch_add(1, AtomicOrdering::Relaxed);
    trace!(pool_name = %self.name(), sentry_id = id, "Sentry created.");
    Some(Sentry {
      pool: self.clone(),
      state: Arc::new(SentryState {
        id,
        results: Mutex::new(Vec::new()),
        pending: WaitGroup::new(0),
      }),
    })
  }
}

impl<R: Clone + Send + 'static> Sentry<R> {
  /// Unique id of this sentry, shared by its clones.
  pub fn id(&self) -> u64 {
    self.state.id
  }

  /// Number of guarded jobs whose chains have not resolved yet.
  pub fn pending(&self) -> usize {
    self.state.pending.count()
  }

  /// Submits `job` to the pool and tracks its fully resolved result.
  ///
  /// A guarded job that never resolves, because the pool did not accept it
  /// or discarded it before its chain finished, is recorded as `None`, so
  /// `wait` never hangs on it.
  pub async fn guard(&self, job: impl Job<R>) {
    self.state.pending.add(1);
    let guarded = Guard {
      record: PendingRecord::new(self.state.clone()),
      job: Box::new(job),
    };

    if !self.pool.try_submit(Box::new(guarded)).await {
      warn!(
        pool_name = %self.pool.name(),
        sentry_id = self.state.id,
        "Guard: pool did not accept the job; it is recorded as an empty result."
      );
    }
  }

  /// Waits for every guarded job to resolve and returns their terminal
  /// values, in completion order. Empty terminals are kept as `None`.
  pub async fn wait(&self) -> Vec<Option<R>> {
    self.state.pending.wait().await;
    self.state.results.lock().clone()
  }
}

/// The pending entry a guarded job owes its sentry. It is settled exactly
/// once: by `settle` when the chain resolves, or with `None` on drop if the
/// job is discarded before that (for example when the job channel closes
/// with the guard still buffered).
struct PendingRecord<R> {
  sentry: Option<Arc<SentryState<R>>>,
}

impl<R> PendingRecord<R> {
  fn new(sentry: Arc<SentryState<R>>) -> Self {
    Self { sentry: Some(sentry) }
  }

  fn sentry_id(&self) -> Option<u64> {
    self.sentry.as_ref().map(|sentry| sentry.id)
  }

  fn settle(mut self, terminal: Option<R>) {
    if let Some(sentry) = self.sentry.take() {
      sentry.record(terminal);
    }
  }
}

impl<R> Drop for PendingRecord<R> {
  fn drop(&mut self) {
    if let Some(sentry) = self.sentry.take() {
      warn!(sentry_id = sentry.id, "Guarded job dropped before its chain resolved; recording an empty result.");
      sentry.record(None);
    }
  }
}

/// First step of a guarded job: runs the caller's job once and hands its
/// outcome on as an `Unguard` continuation.
struct Guard<R: Send + 'static> {
  record: PendingRecord<R>,
  job: Box<dyn Job<R>>,
}

impl<R: Clone + Send + 'static> Job<R> for Guard<R> {
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<R> {
    let Guard { record, job } = *self;
    Box::pin(async move {
      let partial = run_step(job, routine).await;
      Outcome::then(Unguard { record, partial })
    })
  }
}

/// Second step of a guarded job: resolves what is left of the chain and
/// records the terminal value with the owning sentry.
struct Unguard<R: Send + 'static> {
  record: PendingRecord<R>,
  partial: Outcome<R>,
}

impl<R: Clone + Send + 'static> Job<R> for Unguard<R> {
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<R> {
    let Unguard { record, partial } = *self;
    Box::pin(async move {
      let terminal = resolve_chain(partial, routine).await;
      trace!(sentry_id = ?record.sentry_id(), %routine, has_value = terminal.is_some(), "Guarded chain resolved.");
      record.settle(terminal.clone());
      Outcome::Terminal(terminal)
    })
  }
}
