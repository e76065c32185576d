/// Settings for a `WorkerPool`.
///
/// The defaults give the classic hand-off behaviour: a job channel and a
/// result relay that each buffer a single item, so submitters feel
/// backpressure as soon as every routine is busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Name used in log records and spans.
  pub name: String,
  /// Buffer size of the job channel. Values below 1 are treated as 1.
  pub job_capacity: usize,
  /// Buffer size of the result relay. Values below 1 are treated as 1.
  pub relay_capacity: usize,
  /// Keep every non-empty terminal value in a pool-wide collection,
  /// retrievable with `WorkerPool::take_results`.
  pub collect_results: bool,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "chain_pool".to_string(),
      job_capacity: 1,
      relay_capacity: 1,
      collect_results: false,
    }
  }
}

impl PoolConfig {
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_job_capacity(mut self, capacity: usize) -> Self {
    self.job_capacity = capacity;
    self
  }

  pub fn with_relay_capacity(mut self, capacity: usize) -> Self {
    self.relay_capacity = capacity;
    self
  }

  pub fn with_collect_results(mut self, collect: bool) -> Self {
    self.collect_results = collect;
    self
  }
}
