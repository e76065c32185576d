use chain_pool::{job_fn, Job, JobFuture, Outcome, PoolConfig, WorkerPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

// Fetch -> parse -> score, expressed as a chain of continuations.
struct Fetch {
  id: u32,
}

struct Parse {
  id: u32,
  body: String,
}

impl Job<String> for Fetch {
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<String> {
    Box::pin(async move {
      info!("Routine {} fetching document {}", routine, self.id);
      tokio::time::sleep(Duration::from_millis(50 + u64::from(self.id % 3) * 50)).await;
      Outcome::then(Parse {
        id: self.id,
        body: format!("document-{}", self.id),
      })
    })
  }
}

impl Job<String> for Parse {
  fn execute(self: Box<Self>, routine: usize) -> JobFuture<String> {
    Box::pin(async move {
      info!("Routine {} parsing document {}", routine, self.id);
      let words = self.body.len();
      Outcome::then(job_fn(move |_routine| async move {
        Outcome::value(format!("document {} scored {}", self.id, words))
      }))
    })
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Chained Jobs Example ---");

  let pool = WorkerPool::<String>::with_config(
    PoolConfig::default().with_name("demo_pool").with_collect_results(true),
    Handle::current(),
  );
  pool.setup(3).expect("Pool setup failed");

  let sentry = pool.new_sentry().expect("Pool should be live");
  for id in 0..5 {
    sentry.guard(Fetch { id }).await;
  }

  // Unguarded work still lands in the pool-wide collection.
  pool.submit(job_fn(|routine| async move { Outcome::value(format!("heartbeat from routine {}", routine)) })).await;

  for result in sentry.wait().await {
    info!("Guarded result: {:?}", result);
  }

  pool.stop().await.expect("Pool stop failed");
  info!("Pool-wide results: {:?}", pool.take_results());
  info!("--- Chained Jobs Example End ---");
}
