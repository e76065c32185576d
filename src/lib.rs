//! A Tokio-based fixed-size worker pool whose jobs may continue into
//! follow-up jobs.
//!
//! A job's outcome is either a terminal value or a continuation. The pool
//! keeps executing continuations, one after another, until each submitted
//! job's chain reaches a terminal value. A [`Sentry`] lets a caller wait for
//! the resolved results of just the jobs it guarded.

mod barrier;
mod config;
mod error;
mod job;
mod pool;
mod sentry;

pub use config::PoolConfig;
pub use error::PoolError;
pub use job::{job_fn, FnJob, Job, JobFuture, Outcome};
pub use pool::WorkerPool;
pub use sentry::Sentry;
