use chain_pool::{job_fn, Job, JobFuture, Outcome, PoolConfig, PoolError, WorkerPool};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

// Sums its arguments, then continues with a job that divides the sum by 3.
struct AddNumbers {
  args: Vec<u32>,
}

struct DivideByThree {
  sum: u32,
}

impl Job<u32> for AddNumbers {
  fn execute(self: Box<Self>, _routine: usize) -> JobFuture<u32> {
    Box::pin(async move {
      let sum = self.args.iter().sum();
      Outcome::then(DivideByThree { sum })
    })
  }
}

impl Job<u32> for DivideByThree {
  fn execute(self: Box<Self>, _routine: usize) -> JobFuture<u32> {
    Box::pin(async move { Outcome::value(self.sum / 3) })
  }
}

// A chain of `steps` continuations, each sleeping a little, that ends in `value`.
struct SlowChain {
  steps: u32,
  step_ms: u64,
  value: u32,
}

impl Job<u32> for SlowChain {
  fn execute(self: Box<Self>, _routine: usize) -> JobFuture<u32> {
    Box::pin(async move {
      sleep(Duration::from_millis(self.step_ms)).await;
      if self.steps == 0 {
        Outcome::value(self.value)
      } else {
        Outcome::then(SlowChain {
          steps: self.steps - 1,
          ..*self
        })
      }
    })
  }
}

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chain_pool=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn collecting_pool(name: &str) -> WorkerPool<u32> {
  WorkerPool::with_config(
    PoolConfig::default().with_name(name).with_collect_results(true),
    Handle::current(),
  )
}

#[tokio::test]
async fn test_setup_twice_fails_with_already_initialized() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(Handle::current());

  assert_eq!(pool.setup(2), Ok(()));
  assert_eq!(pool.setup(2), Err(PoolError::AlreadyInitialized));
  assert_eq!(pool.routine_count(), Some(2));

  pool.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_on_idle_pool_fails_with_not_initialized() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(Handle::current());
  assert_eq!(pool.stop().await, Err(PoolError::NotInitialized));

  pool.setup(1).unwrap();
  pool.stop().await.unwrap();
  assert_eq!(pool.stop().await, Err(PoolError::NotInitialized));
}

#[tokio::test]
async fn test_setup_with_zero_routines_is_rejected() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::new(Handle::current());
  assert_eq!(pool.setup(0), Err(PoolError::InvalidRoutineCount(0)));
  assert!(!pool.is_live());
}

#[tokio::test]
async fn test_submit_on_idle_pool_is_a_silent_noop() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_idle_submit");
  let executed = Arc::new(AtomicUsize::new(0));

  let executed_in_job = executed.clone();
  let submitted = timeout(
    Duration::from_millis(200),
    pool.submit(job_fn(move |_routine| async move {
      executed_in_job.fetch_add(1, Ordering::SeqCst);
      Outcome::value(1u32)
    })),
  )
  .await;

  assert!(submitted.is_ok(), "submit on an idle pool must not block");
  sleep(Duration::from_millis(20)).await;
  assert_eq!(executed.load(Ordering::SeqCst), 0);
  assert!(pool.take_results().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chains_resolve_before_results_are_recorded() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_chain_resolution");
  pool.setup(3).unwrap();

  let times = 1000;
  for _ in 0..times {
    pool.submit(AddNumbers { args: vec![1, 2, 3] }).await;
  }
  pool.stop().await.unwrap();

  let results = pool.take_results();
  assert_eq!(results.len(), times);
  assert!(results.iter().all(|&value| value == 2), "every chain should resolve to 2");
}

#[tokio::test]
async fn test_empty_terminals_are_not_collected() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_empty_terminals");
  pool.setup(2).unwrap();

  for i in 0..10u32 {
    pool
      .submit(job_fn(move |_routine| async move {
        if i % 2 == 0 {
          Outcome::value(i)
        } else {
          Outcome::empty()
        }
      }))
      .await;
  }
  pool.stop().await.unwrap();

  let mut results = pool.take_results();
  results.sort_unstable();
  assert_eq!(results, vec![0, 2, 4, 6, 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_can_be_set_up_again_after_stop() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_restart");

  for round in 0..3u32 {
    pool.setup(2).unwrap();
    assert!(pool.is_live());
    for _ in 0..20 {
      pool.submit(job_fn(move |_routine| async move { Outcome::value(round) })).await;
    }
    pool.stop().await.unwrap();
    assert!(!pool.is_live());
    assert_eq!(pool.routine_count(), None);
    assert_eq!(pool.in_flight_count(), 0);

    let results = pool.take_results();
    assert_eq!(results.len(), 20, "round {} lost or duplicated results", round);
    assert!(results.iter().all(|&value| value == round));
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_runs_every_job_exactly_once() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::spawn(4, Handle::current()).unwrap();
  let num_jobs = 200usize;
  let runs_per_job: Arc<Vec<AtomicUsize>> = Arc::new((0..num_jobs).map(|_| AtomicUsize::new(0)).collect());

  for job_id in 0..num_jobs {
    let delay_ms = rand::rng().random_range(0..3u64);
    let runs = runs_per_job.clone();
    pool
      .submit(job_fn(move |_routine| async move {
        sleep(Duration::from_millis(delay_ms)).await;
        runs[job_id].fetch_add(1, Ordering::SeqCst);
        Outcome::empty()
      }))
      .await;
  }
  pool.stop().await.unwrap();

  for (job_id, runs) in runs_per_job.iter().enumerate() {
    assert_eq!(runs.load(Ordering::SeqCst), 1, "job {} ran the wrong number of times", job_id);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_waits_for_outstanding_chains() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_stop_drains_chains");
  pool.setup(2).unwrap();

  for value in 0..6u32 {
    pool
      .submit(SlowChain {
        steps: 4,
        step_ms: 10,
        value,
      })
      .await;
  }
  pool.stop().await.unwrap();

  let mut results = pool.take_results();
  results.sort_unstable();
  assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lifecycle_calls_during_stop() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_concurrent_stop");
  pool.setup(1).unwrap();
  pool
    .submit(SlowChain {
      steps: 0,
      step_ms: 300,
      value: 9,
    })
    .await;

  let stopping = {
    let pool = pool.clone();
    tokio::spawn(async move { pool.stop().await })
  };
  sleep(Duration::from_millis(50)).await;

  assert_eq!(pool.stop().await, Err(PoolError::StopInProgress));
  assert_eq!(pool.setup(1), Err(PoolError::AlreadyInitialized));
  assert!(!pool.is_live());

  // Jobs submitted while draining are dropped rather than blocking.
  timeout(
    Duration::from_millis(100),
    pool.submit(job_fn(|_routine| async move { Outcome::value(100u32) })),
  )
  .await
  .expect("submit while stopping should not block");

  assert_eq!(stopping.await.unwrap(), Ok(()));
  assert_eq!(pool.take_results(), vec![9]);
}

#[tokio::test]
async fn test_panicking_job_does_not_wedge_the_pool() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_panic");
  pool.setup(2).unwrap();

  pool
    .submit(job_fn(|_routine| async move {
      if true {
        panic!("job intentionally panicked");
      }
      Outcome::value(0u32)
    }))
    .await;
  pool.submit(AddNumbers { args: vec![3, 3, 3] }).await;

  timeout(Duration::from_secs(2), pool.stop())
    .await
    .expect("stop should not hang after a job panicked")
    .unwrap();
  assert_eq!(pool.take_results(), vec![3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jobs_see_valid_routine_indices() {
  setup_tracing_for_test();
  let pool = collecting_pool("test_pool_routine_ids");
  let routines = 3;
  pool.setup(routines).unwrap();

  let seen = Arc::new(Mutex::new(Vec::new()));
  for _ in 0..50 {
    let seen = seen.clone();
    pool
      .submit(job_fn(move |routine| async move {
        seen.lock().push(routine);
        Outcome::empty()
      }))
      .await;
  }
  pool.stop().await.unwrap();

  let seen = seen.lock();
  assert_eq!(seen.len(), 50);
  assert!(seen.iter().all(|&routine| routine < routines));
}

async fn run_numbered_jobs(pool: &WorkerPool<u32>, num_jobs: u32) -> Vec<u32> {
  pool.setup(3).unwrap();
  for job_id in 0..num_jobs {
    pool.submit(AddNumbers { args: vec![job_id * 3] }).await;
  }
  timeout(Duration::from_secs(5), pool.stop())
    .await
    .expect("stop should drain the pool")
    .unwrap();

  let mut results = pool.take_results();
  results.sort_unstable();
  results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_capacities_are_clamped_to_one() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::with_config(
    PoolConfig::default()
      .with_name("test_pool_zero_capacity")
      .with_collect_results(true)
      .with_job_capacity(0)
      .with_relay_capacity(0),
    Handle::current(),
  );
  assert_eq!(pool.config().job_capacity, 0);

  let results = run_numbered_jobs(&pool, 50).await;
  assert_eq!(results, (0..50).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_larger_buffers_keep_exactly_once_results() {
  setup_tracing_for_test();
  let pool = WorkerPool::<u32>::with_config(
    PoolConfig::default()
      .with_name("test_pool_large_buffers")
      .with_collect_results(true)
      .with_job_capacity(8)
      .with_relay_capacity(8),
    Handle::current(),
  );

  let results = run_numbered_jobs(&pool, 200).await;
  assert_eq!(results, (0..200).collect::<Vec<_>>());
}
