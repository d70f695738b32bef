use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::token::CancellationState;

type BoxedCallback = Box<dyn FnOnce() + Send>;

/// What a single registered callback is currently doing.
enum CallbackState {
    /// Not yet cancelled; holds the callback to run when it is.
    Pending(BoxedCallback),
    /// A cancelling thread has taken the callback and is currently running it.
    Running,
    /// The callback ran to completion.
    Done,
    /// The registration was disposed before cancellation occurred.
    Removed,
}

/// Shared bookkeeping for one `register()` call.
///
/// [`CancellationState::cancel`] and [`CancellationRegistration::dispose`]
/// race on this: at most one of them ever runs the callback, and disposal
/// blocks until a concurrently-running callback has returned. This mirrors
/// [`super::future::FutureWaiter`]'s waker bookkeeping, except a callback
/// registration needs a synchronous, blocking "has it finished" handshake
/// rather than a `Waker`.
pub(crate) struct CallbackEntry {
    state: Mutex<CallbackState>,
    finished: Condvar,
}

impl CallbackEntry {
    pub(crate) fn new(callback: BoxedCallback) -> Self {
        Self {
            state: Mutex::new(CallbackState::Pending(callback)),
            finished: Condvar::new(),
        }
    }

    /// Runs the callback if it hasn't already been removed or run. Safe to
    /// call more than once; only the first caller to observe `Pending` does
    /// anything.
    pub(crate) fn fire(&self) {
        let callback = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, CallbackState::Running) {
                CallbackState::Pending(callback) => Some(callback),
                other => {
                    *state = other;
                    None
                }
            }
        };

        let Some(callback) = callback else {
            return;
        };

        callback();

        let mut state = self.state.lock();
        *state = CallbackState::Done;
        self.finished.notify_all();
    }

    /// Deregisters the callback. If a `fire` call is already in flight, this
    /// blocks until it has returned -- the load-bearing guarantee that makes
    /// waiter reuse after cancellation race-free.
    pub(crate) fn dispose(&self) {
        let mut state = self.state.lock();

        match &*state {
            CallbackState::Pending(_) => {
                *state = CallbackState::Removed;
            }
            CallbackState::Running => {
                self.finished
                    .wait_while(&mut state, |s| matches!(s, CallbackState::Running));
            }
            CallbackState::Done | CallbackState::Removed => {}
        }
    }
}

/// A handle to a callback registered via [`CancellationToken::register`] or
/// [`ReadOnlyCancellationToken::register`][crate::ReadOnlyCancellationToken::register].
///
/// Dropping (or explicitly calling [`Self::dispose`]) deregisters the
/// callback. If cancellation is racing with disposal, disposal blocks until
/// the in-flight callback invocation has returned, so that a caller can
/// safely free or reuse state that the callback might otherwise still be
/// touching.
pub struct CancellationRegistration {
    entry: Option<(Arc<CancellationState>, Arc<CallbackEntry>)>,
}

impl CancellationRegistration {
    pub(crate) fn new(state: Arc<CancellationState>, entry: Arc<CallbackEntry>) -> Self {
        Self {
            entry: Some((state, entry)),
        }
    }

    /// A registration that never fires anything, used when a token was
    /// already cancelled at registration time (the callback ran inline) or
    /// when no token was supplied at all.
    pub(crate) fn noop() -> Self {
        Self { entry: None }
    }

    /// Deregisters the callback, blocking until any in-flight invocation has
    /// returned. Equivalent to dropping the registration; provided
    /// separately so callers can deregister without waiting for a scope
    /// exit.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if let Some((state, entry)) = self.entry.take() {
            entry.dispose();
            state.try_remove_callback(&entry);
        }
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}


#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fire_is_a_no_op_after_dispose() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let entry = CallbackEntry::new(Box::new(move || ran_clone.store(true, Ordering::SeqCst)));
        entry.dispose();
        entry.fire();

        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn dispose_is_a_no_op_after_fire() {
        let entry = CallbackEntry::new(Box::new(|| {}));
        entry.fire();
        // Must not block or panic.
        entry.dispose();
    }

    #[test]
    fn dispose_blocks_until_a_concurrent_fire_has_returned() {
        let entry = Arc::new(CallbackEntry::new(Box::new(|| {
            thread::sleep(Duration::from_millis(50));
        })));

        let firer = {
            let entry = entry.clone();
            thread::spawn(move || entry.fire())
        };

        // Give the firer a chance to claim the callback before we race it.
        thread::sleep(Duration::from_millis(10));
        entry.dispose();

        // If `dispose` had returned before the sleeping callback finished,
        // this join would already have happened; assert it regardless so
        // the intent is explicit.
        firer.join().unwrap();
    }
}
