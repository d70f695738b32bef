//! The completion-source backbone shared by every primitive in this crate.
//!
//! A [`Waiter`] is a single-shot, poolable, versioned completion cell: the
//! primitive either resolves it with a result or a cancellation, exactly
//! once, and the suspended caller observes that outcome exactly once
//! through the [`Ticket`] it was handed at enqueue time.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use cancellation_token::{CancellationRegistration, CancellationToken};
use parking_lot::Mutex;

use crate::error::LockError;

/// What a [`Waiter`] currently holds.
enum WaiterState<R> {
    /// Not yet resolved.
    Pending,
    /// Resolved with a result by `try_claim_with_result`.
    Ready(R),
    /// Resolved with a cancellation by `try_claim_with_cancel`.
    Cancelled,
}

/// A reusable, single-shot completion cell.
///
/// `claimed`-ness is expressed as leaving [`WaiterState::Pending`]: both
/// `try_claim_with_result` and `try_claim_with_cancel` only ever succeed
/// once per lifetime of the waiter, which is the CAS the distilled spec
/// calls for, implemented as a guarded state transition rather than a bare
/// atomic (the same "mutex is safe here: nanosecond duration, no await
/// inside" reasoning the vendored waiter-queue reference code in this
/// crate's corpus documents for itself).
pub(crate) struct Waiter<R> {
    state: Mutex<WaiterState<R>>,
    waker: Mutex<Option<Waker>>,
    version: AtomicU64,
    /// Whether a resolved waiter's waker is invoked inline on the releasing
    /// thread (`true`) or dispatched via `tokio::spawn` (`false`, the safe
    /// default). Set fresh by the primitive on every rent from the pool.
    wake_synchronously: AtomicBool,
}

impl<R> Waiter<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::Pending),
            waker: Mutex::new(None),
            version: AtomicU64::new(0),
            wake_synchronously: AtomicBool::new(false),
        }
    }

    /// The version at time of call; used by [`Ticket`] to detect reuse of a
    /// waiter out from under a still-live caller.
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn set_wake_synchronously(&self, synchronous: bool) {
        self.wake_synchronously.store(synchronous, Ordering::Release);
    }

    /// CAS `Pending -> Ready(value)`. Returns whether this call won the
    /// race -- on failure the cancellation path already owns the waiter.
    pub(crate) fn try_claim_with_result(&self, value: R) -> bool {
        let won = {
            let mut state = self.state.lock();
            if matches!(*state, WaiterState::Pending) {
                *state = WaiterState::Ready(value);
                true
            } else {
                false
            }
        };
        if won {
            self.wake();
        }
        won
    }

    /// CAS `Pending -> Cancelled`. Returns whether this call won the race --
    /// on failure the wakeup path already owns the waiter.
    pub(crate) fn try_claim_with_cancel(&self) -> bool {
        let won = {
            let mut state = self.state.lock();
            if matches!(*state, WaiterState::Pending) {
                *state = WaiterState::Cancelled;
                true
            } else {
                false
            }
        };
        if won {
            self.wake();
        }
        won
    }

    fn wake(&self) {
        let Some(waker) = self.waker.lock().take() else {
            return;
        };

        if self.wake_synchronously.load(Ordering::Acquire) {
            waker.wake();
        } else {
            tokio::spawn(async move { waker.wake() });
        }
    }

    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<R, LockError>>
    where
        R: Send,
    {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, WaiterState::Pending) {
            WaiterState::Pending => {
                // Still pending: (re-)register our waker and keep it Pending.
                drop(state);
                let mut waker_slot = self.waker.lock();
                match waker_slot.as_mut() {
                    Some(existing) => existing.clone_from(cx.waker()),
                    None => *waker_slot = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            WaiterState::Ready(value) => Poll::Ready(Ok(value)),
            WaiterState::Cancelled => Poll::Ready(Err(LockError::Cancelled)),
        }
    }

    /// Clear this waiter back to `Pending` with no waker, and advance the
    /// version so a stale `Ticket` can never observe its next life. Called
    /// exactly once, right after the caller's future observes an outcome and
    /// the caller has dropped its cancellation registration, just before the
    /// waiter is returned to the pool.
    fn reset(&self) {
        *self.state.lock() = WaiterState::Pending;
        self.waker.lock().take();
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// Bounded free list of idle [`Waiter`]s, owned by a single primitive and
/// guarded by that primitive's own critical section (see `pool` module
/// docs for why this crate does not give event primitives a separate
/// lock-free stack).
pub(crate) struct WaiterPool<R> {
    idle: Mutex<Vec<Arc<Waiter<R>>>>,
}

impl<R> WaiterPool<R> {
    pub(crate) fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rent(&self, wake_synchronously: bool) -> Arc<Waiter<R>> {
        let waiter = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(Waiter::new()));
        waiter.set_wake_synchronously(wake_synchronously);
        waiter
    }

    fn give_back(&self, waiter: Arc<Waiter<R>>) {
        self.idle.lock().push(waiter);
    }
}

/// A repair action to run if a waiter is cancelled (either because its
/// bound token fired, or because the future suspended on it was dropped
/// without ever completing). Each primitive supplies its own: removing the
/// waiter from a queue, and/or repairing counters and re-running the
/// release algorithm if the waiter had already been dequeued for delivery.
pub(crate) type RepairFn = Arc<dyn Fn() + Send + Sync>;

/// The caller-side handle returned when a primitive could not grant its
/// resource synchronously. Suspends the caller via [`Self::wait`] until the
/// waiter is resolved, then performs the consume-exactly-once bookkeeping:
/// dropping the cancellation registration, resetting the waiter, and
/// returning it to the pool.
///
/// If this ticket is dropped while still pending -- whether because its
/// bound token fired, or because an enclosing future (a `select!`, a
/// `timeout`) gave up on it without going through the token at all -- the
/// repair action runs exactly as it would for a token-driven cancellation.
/// This is what keeps the primitives safe under ordinary Rust future-drop
/// semantics, not just under the cancellation-token protocol the distilled
/// spec describes.
pub(crate) struct Ticket<R: Send + 'static> {
    waiter: Arc<Waiter<R>>,
    pool: Arc<WaiterPool<R>>,
    repair: RepairFn,
    cancellation: Option<CancellationRegistration>,
    issued_version: u64,
    settled: bool,
}

impl<R: Send + 'static> Ticket<R> {
    pub(crate) fn new(
        waiter: Arc<Waiter<R>>,
        pool: Arc<WaiterPool<R>>,
        repair: RepairFn,
        token: Option<&CancellationToken>,
    ) -> Self {
        let issued_version = waiter.version();

        let cancellation = token.and_then(|token| {
            if !token.can_be_cancelled() {
                return None;
            }

            let bound_waiter = waiter.clone();
            let bound_repair = repair.clone();
            Some(token.register(move || {
                if bound_waiter.try_claim_with_cancel() {
                    bound_repair();
                }
            }))
        });

        Self {
            waiter,
            pool,
            repair,
            cancellation,
            issued_version,
            settled: false,
        }
    }

    pub(crate) async fn wait(mut self) -> Result<R, LockError> {
        let waiter = self.waiter.clone();
        let result = poll_fn(move |cx| waiter.poll_outcome(cx)).await;

        assert_eq!(
            self.waiter.version(),
            self.issued_version,
            "waiter was reused by the pool while a ticket issued against its earlier \
             lifetime was still being consumed -- this is a programming error in the \
             primitive, not something a caller triggered"
        );

        self.settled = true;
        // Dropping the registration here blocks only if a cancel callback
        // raced us and is still running; by the time it returns we know
        // `try_claim_with_result`/`try_claim_with_cancel` has been fully
        // decided, so resetting the waiter below is race-free.
        self.cancellation.take();
        self.waiter.reset();
        self.pool.give_back(self.waiter.clone());

        result
    }
}

impl<R: Send + 'static> Drop for Ticket<R> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        if self.waiter.try_claim_with_cancel() {
            (self.repair)();
        }

        // Synchronize with an in-flight token callback before we let the
        // waiter go back to the pool via a later `give_back` -- but since
        // we never reached `wait`'s completion, nothing will return this
        // waiter to the pool on this path; the primitive that owns it saw
        // it leave the queue (via `repair`) and simply leaks the rented
        // waiter rather than double-granting it. `dispose`'s block keeps
        // this drop race-free regardless.
        self.cancellation.take();
    }
}
