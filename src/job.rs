use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use tracing::{error, trace};

/// The future a job produces when it is executed on a routine.
/// It must be `Send` and `'static`, and yield the job's `Outcome`.
pub type JobFuture<R> = Pin<Box<dyn Future<Output = Outcome<R>> + Send + 'static>>;

/// A unit of work the pool can run.
///
/// Executing a job consumes it. `routine` is the index of the execution
/// routine (or, for continuation steps, the routine whose result started
/// the chain) and is purely informational.
pub trait Job<R: Send + 'static>: Send + 'static {
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<R>;
}

impl<R: Send + 'static> Job<R> for Box<dyn Job<R>> {
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<R> {
    <dyn Job<R> as Job<R>>::execute(*self, routine)
  }
}

/// What executing a job produced.
pub enum Outcome<R: Send + 'static> {
  /// A final value. `None` is the empty result and is still a valid terminal.
  Terminal(Option<R>),
  /// A follow-up job that must run next on the same chain before the chain
  /// has a final value.
  Continuation(Box<dyn Job<R>>),
}

impl<R: Send + 'static> Outcome<R> {
  pub fn value(value: R) -> Self {
    Outcome::Terminal(Some(value))
  }

  pub fn empty() -> Self {
    Outcome::Terminal(None)
  }

  /// Continues the current chain with `job`.
  pub fn then(job: impl Job<R>) -> Self {
    Outcome::Continuation(Box::new(job))
  }

  pub fn is_continuation(&self) -> bool {
    matches!(self, Outcome::Continuation(_))
  }
}

impl<R: Send + 'static> From<Option<R>> for Outcome<R> {
  fn from(value: Option<R>) -> Self {
    Outcome::Terminal(value)
  }
}

impl<R: Send + fmt::Debug + 'static> fmt::Debug for Outcome<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Outcome::Terminal(value) => f.debug_tuple("Terminal").field(value).finish(),
      Outcome::Continuation(_) => f.write_str("Continuation(..)"),
    }
  }
}

/// Adapts an async closure into a `Job`. See [`job_fn`].
pub struct FnJob<F>(F);

/// Wraps `f` so it can be submitted as a job.
///
/// ```ignore
/// pool.submit(job_fn(|routine| async move {
///   Outcome::value(routine * 2)
/// })).await;
/// ```
pub fn job_fn<F>(f: F) -> FnJob<F> {
  FnJob(f)
}

impl<R, F, Fut> Job<R> for FnJob<F>
where
  R: Send + 'static,
  F: FnOnce(usize) -> Fut + Send + 'static,
  Fut: Future<Output = Outcome<R>> + Send + 'static,
{
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<R> {
    Box::pin((self.0)(routine))
  }
}

/// Runs a single job step. A panic, either while building the job's future
/// or while polling it, is logged and turned into an empty terminal.
pub(crate) async fn run_step<R: Send + 'static>(job: Box<dyn Job<R>>, routine: usize) -> Outcome<R> {
  let future = match std::panic::catch_unwind(AssertUnwindSafe(move || job.execute(routine))) {
    Ok(future) => future,
    Err(_panic_payload) => {
      error!(%routine, "Job panicked while starting; its chain resolves to an empty result.");
      return Outcome::empty();
    }
  };

  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(outcome) => outcome,
    Err(_panic_payload) => {
      error!(%routine, "Job panicked during execution; its chain resolves to an empty result.");
      Outcome::empty()
    }
  }
}

/// Follows `outcome` through every continuation until a terminal value is
/// reached. Steps run strictly one after another on the calling task.
pub(crate) async fn resolve_chain<R: Send + 'static>(mut outcome: Outcome<R>, routine: usize) -> Option<R> {
  let mut steps = 0usize;
  loop {
    match outcome {
      Outcome::Terminal(value) => {
        trace!(%routine, steps, "Chain resolved to a terminal value.");
        return value;
      }
      Outcome::Continuation(next) => {
        steps += 1;
        outcome = run_step(next, routine).await;
      }
    }
  }
}
