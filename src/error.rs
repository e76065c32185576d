use thiserror::Error;

/// Errors returned by the lifecycle operations of a `WorkerPool`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Pool already has live job and result channels; stop it before setting it up again")]
  AlreadyInitialized,

  #[error("Pool has no live job and result channels; it was never set up or is already stopped")]
  NotInitialized,

  #[error("Pool is already draining its routines for a stop in progress")]
  StopInProgress,

  #[error("Routine count must be positive, got {0}")]
  InvalidRoutineCount(usize),
}
