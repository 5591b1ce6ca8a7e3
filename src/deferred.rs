//! Single-shot, externally resolvable future.
//!
//! A `Deferred` is settled at most once; every clone of the handle observes
//! the same outcome. An optional timeout task rejects it if it is still
//! pending when the timer fires. Later resolve/reject calls are no-ops.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Settlement state, exposed for inspection and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Resolved,
    Rejected,
}

enum Settlement<T> {
    Pending,
    Resolved { value: T, at: Instant },
    Rejected { error: Error, at: Instant },
}

struct Inner<T> {
    state: Mutex<Settlement<T>>,
    notify: Notify,
    created_at: Instant,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

/// Externally resolvable future handle. Cheap to clone; all clones share one
/// settlement.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Settlement::Pending),
                notify: Notify::new(),
                created_at: Instant::now(),
                timeout_task: Mutex::new(None),
            }),
        }
    }

    /// Settle with a value. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved {
            value,
            at: Instant::now(),
        })
    }

    /// Settle with an error. Returns false if already settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Settlement::Rejected {
            error,
            at: Instant::now(),
        })
    }

    fn settle(&self, settlement: Settlement<T>) -> bool {
        {
            let mut state = self.inner.state.lock().expect("deferred lock poisoned");
            if !matches!(*state, Settlement::Pending) {
                return false;
            }
            *state = settlement;
        }
        if let Some(task) = self
            .inner
            .timeout_task
            .lock()
            .expect("timeout lock poisoned")
            .take()
        {
            task.abort();
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Wait for settlement. Every waiter receives the same value or error.
    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a settlement racing
            // with this check still wakes us.
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    fn outcome(&self) -> Option<Result<T>> {
        let state = self.inner.state.lock().expect("deferred lock poisoned");
        match &*state {
            Settlement::Pending => None,
            Settlement::Resolved { value, .. } => Some(Ok(value.clone())),
            Settlement::Rejected { error, .. } => Some(Err(error.clone())),
        }
    }

    /// Arm a timer that rejects this deferred with a timeout error if it is
    /// still pending when the timer fires. Settlement aborts the timer;
    /// arming again replaces the previous timer.
    pub fn start_timeout(&self, duration: Duration) {
        let deferred = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            deferred.reject(Error::Timeout(duration.as_millis() as u64));
        });
        if let Some(previous) = self
            .inner
            .timeout_task
            .lock()
            .expect("timeout lock poisoned")
            .replace(task)
        {
            previous.abort();
        }
    }

    pub fn state(&self) -> DeferredState {
        let state = self.inner.state.lock().expect("deferred lock poisoned");
        match &*state {
            Settlement::Pending => DeferredState::Pending,
            Settlement::Resolved { .. } => DeferredState::Resolved,
            Settlement::Rejected { .. } => DeferredState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == DeferredState::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == DeferredState::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == DeferredState::Rejected
    }

    pub fn is_settled(&self) -> bool {
        self.state() != DeferredState::Pending
    }

    /// Do two handles share one settlement?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// When this deferred was created. Immutable.
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Time since settlement, or None while pending. The registry sweeper
    /// uses this to decide which entries are old enough to reclaim.
    pub fn settled_for(&self) -> Option<Duration> {
        let state = self.inner.state.lock().expect("deferred lock poisoned");
        match &*state {
            Settlement::Pending => None,
            Settlement::Resolved { at, .. } | Settlement::Rejected { at, .. } => {
                Some(at.elapsed())
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
