use std::fmt;

use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tracing::warn;

/// A countdown that releases its waiters once the count reaches zero.
///
/// The count may go back up after reaching zero; waiters that have not yet
/// observed the zero simply keep waiting for the next one. The event is only
/// set or reset while the count lock is held so it always mirrors `count == 0`.
pub(crate) struct WaitGroup {
  count: Mutex<usize>,
  zero: ManualResetEvent,
}

impl fmt::Debug for WaitGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WaitGroup").field("count", &self.count()).finish()
  }
}

impl WaitGroup {
  pub(crate) fn new(initial: usize) -> Self {
    Self {
      count: Mutex::new(initial),
      zero: ManualResetEvent::new(initial == 0),
    }
  }

  pub(crate) fn add(&self, n: usize) {
    if n == 0 {
      return;
    }
    let mut count = self.count.lock();
    if *count == 0 {
      self.zero.reset();
    }
    *count += n;
  }

  pub(crate) fn done(&self) {
    let mut count = self.count.lock();
    match count.checked_sub(1) {
      Some(remaining) => {
        *count = remaining;
        if remaining == 0 {
          self.zero.set();
        }
      }
      None => warn!("WaitGroup::done called more times than add; ignoring."),
    }
  }

  pub(crate) fn count(&self) -> usize {
    *self.count.lock()
  }

  /// Waits until the count is zero.
  pub(crate) async fn wait(&self) {
    loop {
      if *self.count.lock() == 0 {
        return;
      }
      self.zero.wait().await;
    }
  }
}
