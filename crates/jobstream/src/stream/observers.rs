//! Observer registry and the per-subscription delivery gate.

use std::cell::Cell;
use std::sync::Arc;

use jobstream_proto::Job;
use parking_lot::{ReentrantMutex, RwLock};

use super::state::StateChange;

/// Callback invoked with the stored job after each applied job event.
pub type JobCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// Callback invoked on every connection state transition.
pub type StateCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Registered callbacks, shared by the manager and its connection tasks.
#[derive(Default)]
pub(crate) struct Observers {
    jobs: RwLock<Vec<JobCallback>>,
    states: RwLock<Vec<StateCallback>>,
}

impl Observers {
    pub(crate) fn add_job(&self, callback: JobCallback) {
        self.jobs.write().push(callback);
    }

    pub(crate) fn add_state(&self, callback: StateCallback) {
        self.states.write().push(callback);
    }

    /// Call every job observer in registration order.
    ///
    /// The list is copied first so callbacks may register more observers.
    pub(crate) fn notify_job(&self, job: &Job) {
        let callbacks = self.jobs.read().clone();
        for callback in &callbacks {
            callback(job);
        }
    }

    pub(crate) fn notify_state(&self, change: &StateChange) {
        let callbacks = self.states.read().clone();
        for callback in &callbacks {
            callback(change);
        }
    }
}

/// Open until the subscription is disconnected by the caller.
///
/// Every delivery to observers runs while holding the gate, and closing takes
/// the same lock, so once [`Gate::close_with`] returns no callback for the
/// subscription is running or will run. The lock is reentrant so a callback
/// may disconnect its own subscription.
pub(crate) struct Gate {
    open: ReentrantMutex<Cell<bool>>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.lock().get()
    }

    /// Run `f` if the gate is still open.
    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let open = self.open.lock();
        if open.get() { Some(f()) } else { None }
    }

    /// Run `f` as the last delivery and close the gate.
    ///
    /// Returns false if the gate was already closed, in which case `f` is not
    /// run.
    pub(crate) fn close_with(&self, f: impl FnOnce()) -> bool {
        let open = self.open.lock();
        if !open.get() {
            return false;
        }
        f();
        open.set(false);
        true
    }
}
