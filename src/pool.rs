use crate::barrier::WaitGroup;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::job::{resolve_chain, run_step, Job, JobFuture, Outcome};

use std::sync::Arc;

use kanal::{AsyncReceiver, AsyncSender};
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Sentinel job that tells exactly one routine to exit. Every token handed
/// out by a single `stop` call shares the same barrier.
struct StopToken {
  barrier: Arc<WaitGroup>,
}

impl<R: Send + 'static> Job<R> for StopToken {
  fn execute(self: Box<Self>, _routine: usize) -> JobFuture<R> {
    Box::pin(async { Outcome::<R>::empty() })
  }
}

/// What travels over the job channel.
enum Dispatch<R: Send + 'static> {
  Run(Box<dyn Job<R>>),
  Stop(StopToken),
}

struct LiveChannels<R: Send + 'static> {
  routines: usize,
  jobs_tx: AsyncSender<Dispatch<R>>,
  relay_tx: AsyncSender<Outcome<R>>,
  routine_handles: Vec<JoinHandle<()>>,
}

impl<R: Send + 'static> LiveChannels<R> {
  fn close(&self) {
    let _ = self.jobs_tx.close();
    let _ = self.relay_tx.close();
  }
}

/// Lifecycle of a pool. `setup` and `stop` are the only transitions.
enum PoolState<R: Send + 'static> {
  Idle,
  Live(LiveChannels<R>),
  /// A `stop` call is draining the routines; the channels are still open.
  Stopping(LiveChannels<R>),
}

struct PoolShared<R: Send + 'static> {
  pool_name: Arc<String>,
  config: PoolConfig,
  tokio_handle: TokioHandle,
  state: Mutex<PoolState<R>>,
  collected: Option<Arc<Mutex<Vec<R>>>>,
  in_flight: Arc<WaitGroup>,
}

/// A fixed-size pool of execution routines fed from one job channel.
///
/// Each job's outcome is handed to a chain-follower, which keeps executing
/// continuations until the chain reaches a terminal value. The handle is
/// cheap to clone; every clone drives the same pool.
pub struct WorkerPool<R: Send + 'static> {
  shared: Arc<PoolShared<R>>,
}

impl<R: Send + 'static> Clone for WorkerPool<R> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<R: Send + 'static> WorkerPool<R> {
  /// Creates an idle pool with the default configuration.
  pub fn new(tokio_handle: TokioHandle) -> Self {
    Self::with_config(PoolConfig::default(), tokio_handle)
  }

  pub fn with_config(config: PoolConfig, tokio_handle: TokioHandle) -> Self {
    let collected = config.collect_results.then(|| Arc::new(Mutex::new(Vec::new())));
    Self {
      shared: Arc::new(PoolShared {
        pool_name: Arc::new(config.name.clone()),
        config,
        tokio_handle,
        state: Mutex::new(PoolState::Idle),
        collected,
        in_flight: Arc::new(WaitGroup::new(0)),
      }),
    }
  }

  /// Creates a pool with the default configuration and sets it up with
  /// `routines` execution routines.
  pub fn spawn(routines: usize, tokio_handle: TokioHandle) -> Result<Self, PoolError> {
    let pool = Self::new(tokio_handle);
    pool.setup(routines)?;
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn config(&self) -> &PoolConfig {
    &self.shared.config
  }

  pub fn is_live(&self) -> bool {
    matches!(*self.shared.state.lock(), PoolState::Live(_))
  }

  /// Number of routines, or `None` while the pool is idle.
  pub fn routine_count(&self) -> Option<usize> {
    match &*self.shared.state.lock() {
      PoolState::Live(live) | PoolState::Stopping(live) => Some(live.routines),
      PoolState::Idle => None,
    }
  }

  /// Number of chain-followers that have not finished resolving yet.
  pub fn in_flight_count(&self) -> usize {
    self.shared.in_flight.count()
  }

  /// Opens the job channel and result relay and launches `routines`
  /// execution routines.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyInitialized` if the pool is live or stopping.
  /// Returns `PoolError::InvalidRoutineCount` if `routines` is zero.
  pub fn setup(&self, routines: usize) -> Result<(), PoolError> {
    let pool_name = &self.shared.pool_name;
    let mut state = self.shared.state.lock();
    if !matches!(*state, PoolState::Idle) {
      warn!(pool_name = %**pool_name, "Setup: pool already has live channels.");
      return Err(PoolError::AlreadyInitialized);
    }
    if routines == 0 {
      return Err(PoolError::InvalidRoutineCount(routines));
    }

    let (jobs_tx, jobs_rx) = kanal::bounded_async(self.shared.config.job_capacity.max(1));
    let (relay_tx, relay_rx) = kanal::bounded_async(self.shared.config.relay_capacity.max(1));

    let follower = Follower {
      pool_name: pool_name.clone(),
      relay_rx,
      tokio_handle: self.shared.tokio_handle.clone(),
      collected: self.shared.collected.clone(),
      in_flight: self.shared.in_flight.clone(),
    };

    let routine_handles = (0..routines)
      .map(|routine| {
        self.shared.tokio_handle.spawn(
          run_routine(routine, jobs_rx.clone(), relay_tx.clone(), follower.clone())
            .instrument(info_span!("pool_routine", pool_name = %**pool_name, routine)),
        )
      })
      .collect();

    *state = PoolState::Live(LiveChannels {
      routines,
      jobs_tx,
      relay_tx,
      routine_handles,
    });
    info!(pool_name = %**pool_name, routines, "Pool is live.");
    Ok(())
  }

  /// Queues `job` for execution.
  ///
  /// Waits while the job channel is full. If the pool is not live the job
  /// is dropped without any signal to the caller.
  pub async fn submit(&self, job: impl Job<R>) {
    self.try_submit(Box::new(job)).await;
  }

  /// Like `submit`, but reports whether the job made it onto the channel.
  pub(crate) async fn try_submit(&self, job: Box<dyn Job<R>>) -> bool {
    let Some(jobs_tx) = self.job_sender() else {
      warn!(pool_name = %*self.shared.pool_name, "Submit: pool is not live, dropping job.");
      return false;
    };

    match jobs_tx.send(Dispatch::Run(job)).await {
      Ok(()) => {
        trace!(pool_name = %*self.shared.pool_name, "Job queued.");
        true
      }
      Err(send_error) => {
        warn!(pool_name = %*self.shared.pool_name, "Submit: job channel closed, dropping job: {:?}", send_error);
        false
      }
    }
  }

  fn job_sender(&self) -> Option<AsyncSender<Dispatch<R>>> {
    match &*self.shared.state.lock() {
      PoolState::Live(live) => Some(live.jobs_tx.clone()),
      PoolState::Idle | PoolState::Stopping(_) => None,
    }
  }

  /// Drains the pool and returns it to idle.
  ///
  /// One stop token per routine is queued behind every job already
  /// submitted. Once every routine has consumed its token and every
  /// outstanding chain has resolved, both channels are closed and the
  /// routines are joined. The pool may then be set up again.
  ///
  /// # Errors
  /// Returns `PoolError::NotInitialized` if the pool is idle.
  /// Returns `PoolError::StopInProgress` if another `stop` is still draining.
  pub async fn stop(&self) -> Result<(), PoolError> {
    let pool_name = self.shared.pool_name.clone();

    let (jobs_tx, routines) = {
      let mut state = self.shared.state.lock();
      let live = match std::mem::replace(&mut *state, PoolState::Idle) {
        PoolState::Live(live) => live,
        PoolState::Idle => return Err(PoolError::NotInitialized),
        stopping @ PoolState::Stopping(_) => {
          *state = stopping;
          return Err(PoolError::StopInProgress);
        }
      };
      let drain = (live.jobs_tx.clone(), live.routines);
      *state = PoolState::Stopping(live);
      drain
    };

    info!(pool_name = %*pool_name, routines, "Stopping pool: queueing one stop token per routine.");
    let barrier = Arc::new(WaitGroup::new(routines));
    for _ in 0..routines {
      let token = StopToken {
        barrier: barrier.clone(),
      };
      if let Err(send_error) = jobs_tx.send(Dispatch::Stop(token)).await {
        error!(pool_name = %*pool_name, "Stop: job channel closed while queueing stop tokens: {:?}", send_error);
        barrier.done();
      }
    }

    barrier.wait().await;
    debug!(pool_name = %*pool_name, "Every routine consumed its stop token. Waiting for outstanding chains.");
    self.shared.in_flight.wait().await;

    let live = {
      let mut state = self.shared.state.lock();
      match std::mem::replace(&mut *state, PoolState::Idle) {
        PoolState::Stopping(live) => live,
        other => {
          // Only `stop` leaves the Stopping state, so this is unreachable in practice.
          *state = other;
          error!(pool_name = %*pool_name, "Stop: pool left the stopping state unexpectedly.");
          return Err(PoolError::NotInitialized);
        }
      }
    };
    live.close();

    for handle in live.routine_handles {
      if let Err(join_error) = handle.await {
        error!(pool_name = %*pool_name, "Error joining routine during stop: {:?}", join_error);
      }
    }

    info!(pool_name = %*pool_name, "Pool stopped.");
    Ok(())
  }

  /// Drains the pool-wide collection of terminal values. Always empty unless
  /// `PoolConfig::collect_results` is set.
  pub fn take_results(&self) -> Vec<R> {
    match &self.shared.collected {
      Some(collected) => std::mem::take(&mut *collected.lock()),
      None => Vec::new(),
    }
  }
}

impl<R: Send + 'static> Drop for PoolShared<R> {
  fn drop(&mut self) {
    match std::mem::replace(self.state.get_mut(), PoolState::Idle) {
      PoolState::Live(live) | PoolState::Stopping(live) => {
        info!(
          pool_name = %*self.pool_name,
          "WorkerPool dropped while live. Closing channels; routines will exit on their own."
        );
        live.close();
      }
      PoolState::Idle => {
        trace!(pool_name = %*self.pool_name, "Drop: pool already idle.");
      }
    }
  }
}

/// Everything a chain-follower needs. Cloned into each routine.
struct Follower<R: Send + 'static> {
  pool_name: Arc<String>,
  relay_rx: AsyncReceiver<Outcome<R>>,
  tokio_handle: TokioHandle,
  collected: Option<Arc<Mutex<Vec<R>>>>,
  in_flight: Arc<WaitGroup>,
}

impl<R: Send + 'static> Clone for Follower<R> {
  fn clone(&self) -> Self {
    Self {
      pool_name: self.pool_name.clone(),
      relay_rx: self.relay_rx.clone(),
      tokio_handle: self.tokio_handle.clone(),
      collected: self.collected.clone(),
      in_flight: self.in_flight.clone(),
    }
  }
}

impl<R: Send + 'static> Follower<R> {
  /// Launches a follower for one value pushed to the relay by `routine`.
  /// `stop_barrier` is set when that value came from a stop token.
  fn launch(&self, routine: usize, stop_barrier: Option<Arc<WaitGroup>>) {
    self.in_flight.add(1);
    let follower = self.clone();
    self.tokio_handle.spawn(
      follower
        .follow(routine, stop_barrier)
        .instrument(info_span!("chain_follower", pool_name = %*self.pool_name, routine)),
    );
  }

  async fn follow(self, routine: usize, stop_barrier: Option<Arc<WaitGroup>>) {
    match self.relay_rx.recv().await {
      Ok(outcome) => {
        let terminal = resolve_chain(outcome, routine).await;
        if let (Some(collected), Some(value)) = (&self.collected, terminal) {
          collected.lock().push(value);
        }
      }
      Err(recv_error) => {
        warn!("Result relay closed before a result could be pulled: {:?}", recv_error);
      }
    }

    if let Some(barrier) = stop_barrier {
      barrier.done();
    }
    self.in_flight.done();
  }
}

/// Body of one execution routine. Runs until it consumes a stop token or the
/// job channel is closed.
async fn run_routine<R: Send + 'static>(
  routine: usize,
  jobs_rx: AsyncReceiver<Dispatch<R>>,
  relay_tx: AsyncSender<Outcome<R>>,
  follower: Follower<R>,
) {
  debug!("Routine started.");

  loop {
    let dispatch = match jobs_rx.recv().await {
      Ok(dispatch) => dispatch,
      Err(_) => {
        debug!("Job channel closed. Routine exiting.");
        break;
      }
    };

    let (job, stop_barrier): (Box<dyn Job<R>>, Option<Arc<WaitGroup>>) = match dispatch {
      Dispatch::Run(job) => (job, None),
      Dispatch::Stop(token) => {
        let barrier = token.barrier.clone();
        (Box::new(token), Some(barrier))
      }
    };
    let is_stop = stop_barrier.is_some();

    let outcome = run_step(job, routine).await;
    if relay_tx.send(outcome).await.is_err() {
      warn!("Result relay closed. Routine exiting.");
      if let Some(barrier) = stop_barrier {
        barrier.done();
      }
      break;
    }
    follower.launch(routine, stop_barrier);

    if is_stop {
      debug!("Stop token consumed. Routine exiting.");
      break;
    }
  }
}
