//! A reader/writer lock with writer preference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cancellation_token::CancellationToken;
use parking_lot::Mutex as SyncMutex;
use tracing::trace;

use crate::error::LockError;
use crate::queue::WaiterQueue;
use crate::waiter::{RepairFn, Ticket, Waiter, WaiterPool};

struct State {
    /// Number of readers currently holding the lock.
    active_readers: usize,
    /// Whether a writer currently holds the lock. Mutually exclusive with
    /// `active_readers > 0`.
    writer_active: bool,
    reader_queue: WaiterQueue<()>,
    writer_queue: WaiterQueue<()>,
}

impl State {
    fn free(&self) -> bool {
        self.active_readers == 0 && !self.writer_active
    }

    /// Writer preference: a reader may only be admitted synchronously if no
    /// writer is active *or waiting*.
    fn reader_can_enter(&self) -> bool {
        !self.writer_active && self.writer_queue.is_empty()
    }
}

struct Inner {
    state: SyncMutex<State>,
    reader_pool: Arc<WaiterPool<()>>,
    writer_pool: Arc<WaiterPool<()>>,
    wake_synchronously: bool,
}

impl Inner {
    /// Runs after any reader or writer departs. Writer-preference release
    /// algorithm: hand off to a single queued writer if one is waiting,
    /// otherwise drain every queued reader at once.
    fn release(&self) {
        enum Handoff {
            Writer(Arc<Waiter<()>>),
            Readers(Vec<Arc<Waiter<()>>>),
            None,
        }

        let handoff = {
            let mut state = self.state.lock();
            if state.active_readers != 0 || state.writer_active {
                return;
            }

            if let Some(writer) = state.writer_queue.pop_front() {
                state.writer_active = true;
                Handoff::Writer(writer)
            } else if !state.reader_queue.is_empty() {
                let readers = state.reader_queue.drain_all();
                state.active_readers = readers.len();
                Handoff::Readers(readers)
            } else {
                Handoff::None
            }
        };

        match handoff {
            Handoff::Writer(writer) => {
                trace!("rwlock handing off to queued writer");
                writer.try_claim_with_result(());
            }
            Handoff::Readers(readers) => {
                trace!(count = readers.len(), "rwlock handing off to queued readers");
                for reader in readers {
                    reader.try_claim_with_result(());
                }
            }
            Handoff::None => {}
        }
    }

    fn release_reader(&self) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.active_readers > 0);
            state.active_readers -= 1;
            if state.active_readers != 0 {
                return;
            }
        }
        self.release();
    }

    fn release_writer(&self) {
        {
            let mut state = self.state.lock();
            debug_assert!(state.writer_active);
            state.writer_active = false;
        }
        self.release();
    }

    /// Cancellation repair for a queued reader: either it is still in the
    /// reader queue (remove it), or a racing release already counted it as
    /// an active reader (decrement and re-run the release algorithm).
    fn repair_reader_after_cancel(self: &Arc<Self>, waiter: &Arc<Waiter<()>>) {
        let still_queued = {
            let mut state = self.state.lock();
            state.reader_queue.remove(waiter)
        };

        if still_queued {
            return;
        }

        trace!("rwlock cancelled reader had already been admitted; releasing it");
        self.release_reader();
    }

    /// Cancellation repair for a queued writer: either still queued (remove
    /// it), or already granted exclusive access by a racing release
    /// (release it as a writer).
    fn repair_writer_after_cancel(self: &Arc<Self>, waiter: &Arc<Waiter<()>>) {
        let still_queued = {
            let mut state = self.state.lock();
            state.writer_queue.remove(waiter)
        };

        if still_queued {
            return;
        }

        trace!("rwlock cancelled writer had already been admitted; releasing it");
        self.release_writer();
    }
}

/// An asynchronous reader/writer lock.
///
/// Readers may hold the lock concurrently; a writer holds it exclusively.
/// Writer preference means a reader that arrives while any writer is
/// active or queued waits behind that writer, preventing a steady stream
/// of readers from starving writers.
pub struct RwLock {
    inner: Arc<Inner>,
}

impl RwLock {
    pub fn new(wake_synchronously: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: SyncMutex::new(State {
                    active_readers: 0,
                    writer_active: false,
                    reader_queue: WaiterQueue::new(),
                    writer_queue: WaiterQueue::new(),
                }),
                reader_pool: Arc::new(WaiterPool::new()),
                writer_pool: Arc::new(WaiterPool::new()),
                wake_synchronously,
            }),
        }
    }

    /// Acquires a shared (reader) lock.
    pub async fn enter_reader(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<RwLockReadReleaser<'_>, LockError> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Cancelled);
        }

        let pending = {
            let mut state = self.inner.state.lock();
            if state.reader_can_enter() {
                state.active_readers += 1;
                trace!("rwlock reader acquired synchronously");
                None
            } else {
                let waiter = self.inner.reader_pool.rent(self.inner.wake_synchronously);
                state.reader_queue.push_back(waiter.clone());
                trace!("rwlock enqueued reader");
                Some(waiter)
            }
        };

        let Some(waiter) = pending else {
            return Ok(RwLockReadReleaser::new(self));
        };

        let repair: RepairFn = {
            let inner = self.inner.clone();
            let waiter = waiter.clone();
            Arc::new(move || inner.repair_reader_after_cancel(&waiter))
        };

        let ticket = Ticket::new(waiter, self.inner.reader_pool.clone(), repair, token);
        ticket.wait().await?;

        Ok(RwLockReadReleaser::new(self))
    }

    /// Acquires the exclusive (writer) lock.
    pub async fn enter_writer(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<RwLockWriteReleaser<'_>, LockError> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Cancelled);
        }

        let pending = {
            let mut state = self.inner.state.lock();
            if state.free() {
                state.writer_active = true;
                trace!("rwlock writer acquired synchronously");
                None
            } else {
                let waiter = self.inner.writer_pool.rent(self.inner.wake_synchronously);
                state.writer_queue.push_back(waiter.clone());
                trace!("rwlock enqueued writer");
                Some(waiter)
            }
        };

        let Some(waiter) = pending else {
            return Ok(RwLockWriteReleaser::new(self));
        };

        let repair: RepairFn = {
            let inner = self.inner.clone();
            let waiter = waiter.clone();
            Arc::new(move || inner.repair_writer_after_cancel(&waiter))
        };

        let ticket = Ticket::new(waiter, self.inner.writer_pool.clone(), repair, token);
        ticket.wait().await?;

        Ok(RwLockWriteReleaser::new(self))
    }
}

/// Releases a shared (reader) hold on the lock, on drop or explicit
/// [`Self::dispose`].
pub struct RwLockReadReleaser<'a> {
    lock: &'a RwLock,
    disposed: AtomicBool,
}

impl<'a> RwLockReadReleaser<'a> {
    fn new(lock: &'a RwLock) -> Self {
        Self {
            lock,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            panic!("{}", LockError::MisuseDoubleRelease);
        }
        self.lock.inner.release_reader();
    }
}

impl Drop for RwLockReadReleaser<'_> {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.lock.inner.release_reader();
        }
    }
}

/// Releases the exclusive (writer) hold on the lock, on drop or explicit
/// [`Self::dispose`].
pub struct RwLockWriteReleaser<'a> {
    lock: &'a RwLock,
    disposed: AtomicBool,
}

impl<'a> RwLockWriteReleaser<'a> {
    fn new(lock: &'a RwLock) -> Self {
        Self {
            lock,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            panic!("{}", LockError::MisuseDoubleRelease);
        }
        self.lock.inner.release_writer();
    }
}

impl Drop for RwLockWriteReleaser<'_> {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.lock.inner.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use cancellation_token::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn multiple_readers_run_concurrently() {
        let lock = Arc::new(RwLock::new(false));
        let a = lock.enter_reader(None).await.unwrap();
        let b = lock.enter_reader(None).await.unwrap();
        a.dispose();
        b.dispose();
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new(false));
        let writer = lock.enter_writer(None).await.unwrap();

        let lock_clone = lock.clone();
        let reader_task = tokio::spawn(async move {
            let releaser = lock_clone.enter_reader(None).await.unwrap();
            releaser.dispose();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader_task.is_finished());

        writer.dispose();
        reader_task.await.unwrap();
    }

    #[tokio::test]
    async fn writer_preference_blocks_late_readers_behind_a_queued_writer() {
        let lock = Arc::new(RwLock::new(false));
        let reader_hold = lock.enter_reader(None).await.unwrap();

        // Writer arrives while a reader is active -- queues.
        let lock_clone = lock.clone();
        let writer_task = tokio::spawn(async move {
            let releaser = lock_clone.enter_writer(None).await.unwrap();
            releaser.dispose();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second reader arrives after the writer is already queued --
        // writer preference means it must queue behind the writer, not
        // jump ahead of it.
        let lock_clone = lock.clone();
        let late_reader_task = tokio::spawn(async move {
            let releaser = lock_clone.enter_reader(None).await.unwrap();
            releaser.dispose();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer_task.is_finished());
        assert!(!late_reader_task.is_finished());

        reader_hold.dispose();
        writer_task.await.unwrap();
        late_reader_task.await.unwrap();
    }

    #[tokio::test]
    async fn random_cancellation_never_leaves_the_lock_stuck() {
        let lock = Arc::new(RwLock::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..200 {
            let lock = lock.clone();
            let completed = completed.clone();
            let cancelled = cancelled.clone();

            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                if i % 3 == 0 {
                    let token_clone = token.clone();
                    // Deterministic pseudo-jitter derived from the task
                    // index, so this test has no new dependency and no
                    // nondeterministic source of time.
                    let jitter = (i * 7919) % 3;
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(jitter as u64)).await;
                        token_clone.cancel();
                    });
                }

                let result = if i % 2 == 0 {
                    lock.enter_reader(Some(&token)).await.map(|r| {
                        r.dispose();
                    })
                } else {
                    lock.enter_writer(Some(&token)).await.map(|r| {
                        r.dispose();
                    })
                };

                match result {
                    Ok(()) => {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(LockError::Cancelled) => {
                        cancelled.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            completed.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst),
            200
        );

        // The lock must still be fully usable afterwards.
        let releaser = lock.enter_writer(None).await.unwrap();
        releaser.dispose();
    }
}
