//! Auto-reset and manual-reset signal events, sharing a common core.

use std::sync::Arc;

use cancellation_token::CancellationToken;
use parking_lot::Mutex as SyncMutex;
use tracing::trace;

use crate::error::LockError;
use crate::queue::WaiterQueue;
use crate::waiter::{RepairFn, Ticket, Waiter, WaiterPool};

struct State {
    signalled: bool,
    waiters: WaiterQueue<()>,
    disposed: bool,
}

/// Which reset discipline a [`Core`] implements. The state machine and
/// queue are identical between the two events; only what happens to
/// `signalled` around a wakeup differs, so both public types are thin
/// wrappers over the same private core rather than duplicated logic.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Discipline {
    /// `wait()` consumes the signal: at most one waiter (queued or
    /// synchronous) observes a given `set()` call before the event reverts
    /// to unsignalled.
    Auto,
    /// `set()` stays signalled until an explicit `reset()`; every waiter,
    /// present and future, observes it until then.
    Manual,
}

struct Core {
    state: SyncMutex<State>,
    pool: Arc<WaiterPool<()>>,
    wake_synchronously: bool,
    discipline: Discipline,
}

impl Core {
    fn new(discipline: Discipline, initially_signalled: bool, wake_synchronously: bool) -> Self {
        Self {
            state: SyncMutex::new(State {
                signalled: initially_signalled,
                waiters: WaiterQueue::new(),
                disposed: false,
            }),
            pool: Arc::new(WaiterPool::new()),
            wake_synchronously,
            discipline,
        }
    }

    fn is_set(&self) -> bool {
        self.state.lock().signalled
    }

    /// Marks this event disposed and abandons any currently queued waiters.
    /// Abandoned waiters are never resolved -- they remain suspended
    /// forever, matching standard OS reset-event semantics on disposal --
    /// this only makes the `Core` forget about them, it does not wake them.
    fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.waiters = WaiterQueue::new();
    }

    fn set(self: &Arc<Self>) -> Result<(), LockError> {
        if self.state.lock().disposed {
            return Err(LockError::Disposed);
        }
        match self.discipline {
            Discipline::Auto => self.set_auto(),
            Discipline::Manual => self.set_manual(),
        }
        Ok(())
    }

    /// Auto-reset `set()`: if anyone is queued, wake exactly one and leave
    /// the event unsignalled (the signal was immediately consumed). If
    /// nobody is queued, latch `signalled = true` for the next `wait()`.
    ///
    /// This is the canonical iterative re-check resolution: rather than
    /// wake a waiter and hope it actually consumes the signal, we drain the
    /// queue one entry at a time until one of them wins the claim race
    /// (a concurrent cancellation may have beaten us to a given waiter).
    fn set_auto(&self) {
        let woken = loop {
            let candidate = {
                let mut state = self.state.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => Some(waiter),
                    None => {
                        state.signalled = true;
                        None
                    }
                }
            };

            let Some(waiter) = candidate else {
                break false;
            };

            if waiter.try_claim_with_result(()) {
                break true;
            }
            // This waiter lost the race to a concurrent cancellation; try
            // the next one in line instead of consuming the signal on a
            // waiter that will never observe it.
        };

        if woken {
            trace!("auto-reset event woke exactly one queued waiter");
        } else {
            trace!("auto-reset event latched signalled with no queued waiter");
        }
    }

    /// Manual-reset `set()`: latch `signalled = true` and wake every queued
    /// waiter; none of them consume the signal.
    fn set_manual(&self) {
        let woken = {
            let mut state = self.state.lock();
            state.signalled = true;
            state.waiters.drain_all()
        };

        trace!(count = woken.len(), "manual-reset event broadcast to queued waiters");
        for waiter in woken {
            waiter.try_claim_with_result(());
        }
    }

    fn reset(&self) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(LockError::Disposed);
        }
        state.signalled = false;
        Ok(())
    }

    /// Repairs state after a queued waiter was cancelled. Unlike the lock
    /// primitives, there is no "already granted, now releasing" branch here
    /// for the manual-reset case -- a manual-reset waiter that lost the
    /// claim race was woken by a `set()` that also latched the event, and no
    /// further bookkeeping is owed to it. Auto-reset has the same property:
    /// a waiter that lost its claim race to `set_auto`'s loop is simply
    /// gone, and the signal it failed to consume was already handed to the
    /// next candidate (or latched) by that loop itself.
    fn repair_after_cancel(&self, waiter: &Arc<Waiter<()>>) {
        let mut state = self.state.lock();
        state.waiters.remove(waiter);
    }

    async fn wait(self: &Arc<Self>, token: Option<&CancellationToken>) -> Result<(), LockError> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Cancelled);
        }

        let pending = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(LockError::Disposed);
            }
            if state.signalled {
                if self.discipline == Discipline::Auto {
                    state.signalled = false;
                }
                trace!("reset event observed already-signalled state synchronously");
                None
            } else {
                let waiter = self.pool.rent(self.wake_synchronously);
                state.waiters.push_back(waiter.clone());
                Some(waiter)
            }
        };

        let Some(waiter) = pending else {
            return Ok(());
        };

        let repair: RepairFn = {
            let core = self.clone();
            let waiter = waiter.clone();
            Arc::new(move || core.repair_after_cancel(&waiter))
        };

        let ticket = Ticket::new(waiter, self.pool.clone(), repair, token);
        ticket.wait().await
    }
}

/// A signal that wakes exactly one waiter per [`Self::set`] call.
///
/// If `set()` is called while a waiter is queued, that waiter is woken and
/// the event immediately reverts to unsignalled. If `set()` is called with
/// nobody queued, the signal is latched and the next `wait()` call (however
/// much later) consumes it synchronously.
pub struct AutoResetEvent {
    core: Arc<Core>,
}

impl AutoResetEvent {
    pub fn new(initially_signalled: bool, wake_synchronously: bool) -> Self {
        Self {
            core: Arc::new(Core::new(Discipline::Auto, initially_signalled, wake_synchronously)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.core.is_set()
    }

    pub fn set(&self) -> Result<(), LockError> {
        self.core.set()
    }

    pub async fn wait(&self, token: Option<&CancellationToken>) -> Result<(), LockError> {
        self.core.wait(token).await
    }

    /// Marks the event disposed. Subsequent `set`/`wait` fail with
    /// [`LockError::Disposed`]; waits already in flight remain suspended
    /// forever, matching standard OS reset-event semantics on disposal.
    pub fn dispose(&self) {
        self.core.dispose();
    }
}

/// A signal that stays set until explicitly [`Self::reset`], waking every
/// waiter (present and future) each time it transitions to set.
pub struct ManualResetEvent {
    core: Arc<Core>,
}

impl ManualResetEvent {
    pub fn new(initially_signalled: bool, wake_synchronously: bool) -> Self {
        Self {
            core: Arc::new(Core::new(Discipline::Manual, initially_signalled, wake_synchronously)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.core.is_set()
    }

    pub fn set(&self) -> Result<(), LockError> {
        self.core.set()
    }

    pub fn reset(&self) -> Result<(), LockError> {
        self.core.reset()
    }

    pub async fn wait(&self, token: Option<&CancellationToken>) -> Result<(), LockError> {
        self.core.wait(token).await
    }

    /// Marks the event disposed. Subsequent `set`/`reset`/`wait` fail with
    /// [`LockError::Disposed`]; waits already in flight remain suspended
    /// forever, matching standard OS reset-event semantics on disposal.
    pub fn dispose(&self) {
        self.core.dispose();
    }
}
