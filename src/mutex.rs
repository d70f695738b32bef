//! A one-at-a-time exclusive asynchronous lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cancellation_token::CancellationToken;
use parking_lot::Mutex as SyncMutex;
use tracing::trace;

use crate::error::LockError;
use crate::queue::WaiterQueue;
use crate::waiter::{RepairFn, Ticket, Waiter, WaiterPool};

struct State {
    active: bool,
    waiters: WaiterQueue<()>,
}

struct Inner {
    state: SyncMutex<State>,
    pool: Arc<WaiterPool<()>>,
    wake_synchronously: bool,
}

impl Inner {
    /// Releases the lock, handing it directly to the next queued waiter if
    /// any, or marking it free.
    fn release(&self) {
        let next = {
            let mut state = self.state.lock();
            match state.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    state.active = false;
                    None
                }
            }
        };

        if let Some(waiter) = next {
            trace!("mutex handing lock to next waiter");
            waiter.try_claim_with_result(());
        }
    }

    /// Repairs state after a waiter was cancelled (token fired, or its
    /// ticket was dropped). Handles both cancellation-race outcomes from
    /// §4.3: still queued (just drop it), or already dequeued for delivery
    /// by a racing `release` (treat it as if it had acquired and is now
    /// releasing, so the lock is never left stuck).
    fn repair_after_cancel(self: &Arc<Self>, waiter: &Arc<Waiter<()>>) {
        let still_queued = {
            let mut state = self.state.lock();
            state.waiters.remove(waiter)
        };

        if still_queued {
            trace!("mutex removed cancelled waiter from queue");
            return;
        }

        trace!("mutex cancelled waiter had already been granted the lock; re-releasing");
        self.release();
    }
}

/// A mutual-exclusion lock for cooperative tasks.
///
/// Unlike `std::sync::Mutex` or `tokio::sync::Mutex`, `Mutex` does not wrap
/// a value -- it is a pure permission token, acquired with [`Mutex::enter`]
/// and released by dropping (or explicitly [`MutexReleaser::dispose`]-ing)
/// the returned [`MutexReleaser`]. Recursive acquisition from the same task
/// is not supported and will deadlock, as with any other mutex.
pub struct Mutex {
    inner: Arc<Inner>,
}

impl Mutex {
    /// Creates an unlocked mutex.
    ///
    /// `wake_synchronously` selects whether a released waiter's continuation
    /// runs inline on the releasing thread (`true`, fast but reentrancy-risky)
    /// or is dispatched via `tokio::spawn` (`false`, the safe default).
    pub fn new(wake_synchronously: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: SyncMutex::new(State {
                    active: false,
                    waiters: WaiterQueue::new(),
                }),
                pool: Arc::new(WaiterPool::new()),
                wake_synchronously,
            }),
        }
    }

    /// Acquires the lock, suspending the caller if it is already held.
    ///
    /// If `token` is already cancelled, fails immediately without touching
    /// any state. Otherwise, grants the lock synchronously if free (fast
    /// path), or enqueues a waiter and suspends until it is this waiter's
    /// turn or `token` fires.
    pub async fn enter(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<MutexReleaser<'_>, LockError> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Cancelled);
        }

        let pending = {
            let mut state = self.inner.state.lock();
            if !state.active {
                state.active = true;
                trace!("mutex acquired synchronously");
                None
            } else {
                let waiter = self.inner.pool.rent(self.inner.wake_synchronously);
                state.waiters.push_back(waiter.clone());
                trace!(queue_len = state.waiters.len(), "mutex enqueued waiter");
                Some(waiter)
            }
        };

        let Some(waiter) = pending else {
            return Ok(MutexReleaser::new(self));
        };

        let repair: RepairFn = {
            let inner = self.inner.clone();
            let waiter = waiter.clone();
            Arc::new(move || inner.repair_after_cancel(&waiter))
        };

        let ticket = Ticket::new(waiter, self.inner.pool.clone(), repair, token);
        ticket.wait().await?;

        Ok(MutexReleaser::new(self))
    }
}

/// A single-use permission to release a [`Mutex`].
///
/// Dropping the releaser releases the lock. [`Self::dispose`] does the same
/// thing explicitly and panics if called a second time, matching the
/// distilled spec's `MisuseDoubleRelease` requirement.
pub struct MutexReleaser<'a> {
    mutex: &'a Mutex,
    disposed: AtomicBool,
}

impl<'a> MutexReleaser<'a> {
    fn new(mutex: &'a Mutex) -> Self {
        Self {
            mutex,
            disposed: AtomicBool::new(false),
        }
    }

    /// Releases the lock. Panics if called more than once on the same
    /// releaser.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            panic!("{}", LockError::MisuseDoubleRelease);
        }
        self.mutex.inner.release();
    }
}

impl Drop for MutexReleaser<'_> {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.mutex.inner.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use cancellation_token::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn uncontended_enter_succeeds_synchronously() {
        let mutex = Mutex::new(false);
        let releaser = mutex.enter(None).await.unwrap();
        releaser.dispose();
    }

    #[tokio::test]
    async fn second_enter_waits_for_release() {
        let mutex = Arc::new(Mutex::new(false));
        let first = mutex.enter(None).await.unwrap();

        let mutex_clone = mutex.clone();
        let waiter_task = tokio::spawn(async move {
            let releaser = mutex_clone.enter(None).await.unwrap();
            releaser.dispose();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter_task.is_finished());

        first.dispose();
        waiter_task.await.unwrap();
    }

    #[tokio::test]
    async fn fifo_order_across_four_waiters() {
        let mutex = Arc::new(Mutex::new(false));
        let completion_order = Arc::new(SyncMutex::new(Vec::new()));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let current_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for id in 0..4 {
            let mutex = mutex.clone();
            let completion_order = completion_order.clone();
            let max_concurrent = max_concurrent.clone();
            let current_concurrent = current_concurrent.clone();

            handles.push(tokio::spawn(async move {
                let releaser = mutex.enter(None).await.unwrap();
                let now = current_concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(10)).await;

                current_concurrent.fetch_sub(1, Ordering::SeqCst);
                completion_order.lock().push(id);
                releaser.dispose();
            }));

            // Sequential-await construction: each task must actually be
            // enqueued before we spawn the next one.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(*completion_order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cancellation_releases_next_waiter() {
        let mutex = Arc::new(Mutex::new(false));
        let holder = mutex.enter(None).await.unwrap();

        let cancel_token = CancellationToken::new();
        let cancelled_result = {
            let mutex = mutex.clone();
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move { mutex.enter(Some(&cancel_token)).await })
        };

        let successful_result = {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.enter(None).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel_token.cancel();

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.dispose();

        assert!(matches!(
            cancelled_result.await.unwrap(),
            Err(LockError::Cancelled)
        ));
        let releaser = successful_result.await.unwrap().unwrap();
        releaser.dispose();
    }

    #[test]
    #[should_panic(expected = "dispose() was called more than once")]
    fn double_dispose_panics() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mutex = Mutex::new(false);
            let releaser = mutex.enter(None).await.unwrap();
            releaser.dispose();
            releaser.dispose();
        });
    }
}
