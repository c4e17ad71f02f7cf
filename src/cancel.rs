//! Cooperative cancellation shared between the control thread and workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Result, TaskError};

struct CancelState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable cancellation flag with interruptible sleeps.
///
/// Sleeps wake as soon as the token is cancelled, so every wait built on
/// `sleep` stops within one poll interval at worst.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Raise the flag and wake every sleeper. Repeated calls are harmless.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().expect("cancel mutex poisoned");
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if the flag is raised.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let guard = self.inner.lock.lock().expect("cancel mutex poisoned");
        let _ = self
            .inner
            .wake
            .wait_timeout_while(guard, duration, |_| !self.is_cancelled())
            .expect("condvar wait failed");
        self.checkpoint()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
