//! Guarded single-initialization with five retry/publication disciplines.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cancellation_token::CancellationToken;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex as SyncMutex;
use tracing::trace;

use crate::mutex::Mutex as InnerMutex;

/// Which retry/publication discipline a [`Lazy`] follows. See [`Lazy::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyMode {
    /// No concurrency protection, no retry. The factory may run more than
    /// once under contention; whichever caller's outcome is stored last
    /// wins, and it is permanent.
    None,
    /// Like `None`, but a failed or cancelled attempt clears the stored
    /// outcome so the next caller retries the factory.
    NoneWithRetry,
    /// No critical section around the factory call itself. On success, the
    /// first caller to publish wins and every caller (including ones whose
    /// own attempt lost the race) observes that winning value. Failures are
    /// never published; each caller observes only its own failure and may
    /// retry.
    PublicationOnly,
    /// Callers contend for an internal async mutex; the first to acquire it
    /// invokes the factory and publishes the outcome (success or failure)
    /// for everyone, releasing the mutex before awaiting the factory so
    /// other callers are never blocked behind a long-running factory call.
    ExecutionAndPublication,
    /// Like `ExecutionAndPublication`, but the internal mutex is held for
    /// the entire factory attempt, including the await. Only a successful
    /// outcome is published; a failure releases the mutex and lets the
    /// next caller retry.
    ExecutionAndPublicationWithRetry,
}

/// The outcome a [`Lazy`] has observed, analogous to a completed task's
/// disposition. Wrapped in `Arc` so every caller can share the same
/// instance without requiring `T`/`E` to be `Clone`.
enum LazyOutcome<T, E> {
    Success(Arc<T>),
    Faulted(Arc<E>),
    Cancelled,
}

impl<T, E> Clone for LazyOutcome<T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Success(value) => Self::Success(value.clone()),
            Self::Faulted(error) => Self::Faulted(error.clone()),
            Self::Cancelled => Self::Cancelled,
        }
    }
}

/// The error half of a [`Lazy::get`] outcome.
#[derive(Debug)]
pub enum LazyError<E> {
    /// The caller's own cancellation token fired before an outcome was
    /// observed. Never published to other callers.
    Cancelled,
    /// The factory failed. Shared with every caller that observes this
    /// exact failure (non-retry/`ExecutionAndPublication` modes); a private
    /// copy of the caller's own attempt otherwise (`PublicationOnly`,
    /// `*WithRetry` failure paths).
    Faulted(Arc<E>),
}

fn outcome_to_result<T, E>(outcome: LazyOutcome<T, E>) -> Result<Arc<T>, LazyError<E>> {
    match outcome {
        LazyOutcome::Success(value) => Ok(value),
        LazyOutcome::Faulted(error) => Err(LazyError::Faulted(error)),
        LazyOutcome::Cancelled => Err(LazyError::Cancelled),
    }
}

type BoxedFactoryFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type SharedOutcomeFuture<T, E> = Shared<Pin<Box<dyn Future<Output = LazyOutcome<T, E>> + Send>>>;

/// A thread-safe, asynchronous, guarded single-initialization cell.
///
/// `T` and `E` are never required to be `Clone`; all sharing across callers
/// happens via `Arc`.
pub struct Lazy<T, E, F>
where
    F: Fn() -> BoxedFactoryFuture<T, E> + Send + Sync,
{
    mode: LazyMode,
    factory: SyncMutex<Option<F>>,
    value: SyncMutex<Option<LazyOutcome<T, E>>>,
    /// Populated only by the two `ExecutionAndPublication*` modes, to
    /// deduplicate concurrent factory invocations behind a single shared
    /// future.
    in_flight: SyncMutex<Option<SharedOutcomeFuture<T, E>>>,
    /// This crate's own async mutex, used only by the two
    /// `ExecutionAndPublication*` modes -- the one place in this crate
    /// where a lock must be held across an `.await` of arbitrary caller
    /// code, which is exactly what an async-aware mutex is for.
    mutex: InnerMutex,
}

impl<T, E, F> Lazy<T, E, F>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
    F: Fn() -> BoxedFactoryFuture<T, E> + Send + Sync,
{
    pub fn new(mode: LazyMode, factory: F, wake_synchronously: bool) -> Self {
        Self {
            mode,
            factory: SyncMutex::new(Some(factory)),
            value: SyncMutex::new(None),
            in_flight: SyncMutex::new(None),
            mutex: InnerMutex::new(wake_synchronously),
        }
    }

    /// Returns the stored outcome, computing it via the factory according
    /// to this cell's [`LazyMode`] if necessary.
    pub async fn get(&self, token: Option<&CancellationToken>) -> Result<Arc<T>, LazyError<E>> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(LazyError::Cancelled);
        }

        match self.mode {
            LazyMode::None => self.get_none(false).await,
            LazyMode::NoneWithRetry => self.get_none(true).await,
            LazyMode::PublicationOnly => self.get_publication_only().await,
            LazyMode::ExecutionAndPublication => self.get_execution_and_publication(token).await,
            LazyMode::ExecutionAndPublicationWithRetry => {
                self.get_execution_and_publication_with_retry(token).await
            }
        }
    }

    /// Invokes the factory, or, if a concurrent caller has already consumed
    /// and dropped it, returns the outcome that caller published instead.
    /// The two-lock-acquisition gap between a caller's own value-check and
    /// this method's factory-check is exactly where such a race lands: on a
    /// multi-threaded runtime another task can publish a value and drop the
    /// factory in between, so the factory being gone is read as "someone
    /// already finished", never as a bug.
    async fn invoke_factory(&self) -> Result<Result<T, E>, LazyOutcome<T, E>> {
        let factory_future = {
            let factory = self.factory.lock();
            match factory.as_ref() {
                Some(factory) => factory(),
                None => {
                    drop(factory);
                    let outcome = self
                        .value
                        .lock()
                        .clone()
                        .expect("factory is only ever dropped after an outcome is published");
                    return Err(outcome);
                }
            }
        };
        Ok(factory_future.await)
    }

    async fn get_none(&self, retry: bool) -> Result<Arc<T>, LazyError<E>> {
        if let Some(outcome) = self.value.lock().clone() {
            return outcome_to_result(outcome);
        }

        let outcome = match self.invoke_factory().await {
            Err(published) => return outcome_to_result(published),
            Ok(Ok(value)) => LazyOutcome::Success(Arc::new(value)),
            Ok(Err(error)) => LazyOutcome::Faulted(Arc::new(error)),
        };

        if retry && !matches!(outcome, LazyOutcome::Success(_)) {
            trace!("lazy: factory failed in retry mode, leaving value unset");
        } else {
            *self.value.lock() = Some(outcome.clone());
            // Non-retry modes publish the outcome once and never call the
            // factory again, win or lose, so it is dropped unconditionally.
            self.factory.lock().take();
        }

        outcome_to_result(outcome)
    }

    async fn get_publication_only(&self) -> Result<Arc<T>, LazyError<E>> {
        if let Some(outcome @ LazyOutcome::Success(_)) = self.value.lock().clone() {
            return outcome_to_result(outcome);
        }

        match self.invoke_factory().await {
            Err(published) => outcome_to_result(published),
            Ok(Ok(value)) => {
                let published = {
                    let mut value_slot = self.value.lock();
                    if !matches!(*value_slot, Some(LazyOutcome::Success(_))) {
                        *value_slot = Some(LazyOutcome::Success(Arc::new(value)));
                    }
                    value_slot.clone().expect("just published")
                };
                self.factory.lock().take();
                outcome_to_result(published)
            }
            Ok(Err(error)) => {
                trace!("lazy: publication-only factory attempt failed, not published");
                Err(LazyError::Faulted(Arc::new(error)))
            }
        }
    }

    async fn get_execution_and_publication(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<Arc<T>, LazyError<E>> {
        if let Some(shared) = self.in_flight.lock().clone() {
            return outcome_to_result(shared.await);
        }

        let releaser = self
            .mutex
            .enter(token)
            .await
            .map_err(|_| LazyError::Cancelled)?;

        if let Some(shared) = self.in_flight.lock().clone() {
            releaser.dispose();
            return outcome_to_result(shared.await);
        }

        let factory_future = {
            let factory = self.factory.lock();
            let factory = factory
                .as_ref()
                .expect("factory invoked after it was already dropped");
            factory()
        };

        let shared: SharedOutcomeFuture<T, E> = async move {
            match factory_future.await {
                Ok(value) => LazyOutcome::Success(Arc::new(value)),
                Err(error) => LazyOutcome::Faulted(Arc::new(error)),
            }
        }
        .boxed()
        .shared();

        *self.in_flight.lock() = Some(shared.clone());
        self.factory.lock().take();
        // Release before awaiting: other callers see `in_flight` already
        // populated and never have to wait on this mutex at all.
        releaser.dispose();

        let outcome = shared.await;
        *self.value.lock() = Some(outcome.clone());
        outcome_to_result(outcome)
    }

    async fn get_execution_and_publication_with_retry(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<Arc<T>, LazyError<E>> {
        loop {
            if let Some(outcome @ LazyOutcome::Success(_)) = self.value.lock().clone() {
                return outcome_to_result(outcome);
            }

            let releaser = self
                .mutex
                .enter(token)
                .await
                .map_err(|_| LazyError::Cancelled)?;

            if let Some(outcome @ LazyOutcome::Success(_)) = self.value.lock().clone() {
                releaser.dispose();
                return outcome_to_result(outcome);
            }

            let result = self.invoke_factory().await;
            match result {
                Ok(value) => {
                    let arc = Arc::new(value);
                    *self.value.lock() = Some(LazyOutcome::Success(arc.clone()));
                    self.factory.lock().take();
                    releaser.dispose();
                    return Ok(arc);
                }
                Err(error) => {
                    releaser.dispose();
                    trace!("lazy: with-retry factory attempt failed, value remains unset");
                    return Err(LazyError::Faulted(Arc::new(error)));
                }
            }
        }
    }

    /// Whether a value (successful, faulted, or cancelled) has been
    /// published at all. Best-effort, not stable under retry modes.
    pub fn value_created(&self) -> bool {
        self.value.lock().is_some()
    }

    pub fn completed(&self) -> bool {
        matches!(
            *self.value.lock(),
            Some(LazyOutcome::Success(_)) | Some(LazyOutcome::Faulted(_))
        )
    }

    pub fn faulted(&self) -> bool {
        matches!(*self.value.lock(), Some(LazyOutcome::Faulted(_)))
    }

    pub fn cancelled(&self) -> bool {
        matches!(*self.value.lock(), Some(LazyOutcome::Cancelled))
    }

    pub fn completed_successfully(&self) -> bool {
        matches!(*self.value.lock(), Some(LazyOutcome::Success(_)))
    }

    /// Whether a future call to [`Self::get`] might still invoke the
    /// factory again.
    pub fn is_retryable(&self) -> bool {
        match self.mode {
            LazyMode::None | LazyMode::ExecutionAndPublication => false,
            LazyMode::NoneWithRetry
            | LazyMode::PublicationOnly
            | LazyMode::ExecutionAndPublicationWithRetry => !self.completed_successfully(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn boxed<T, E>(
        fut: impl Future<Output = Result<T, E>> + Send + 'static,
    ) -> BoxedFactoryFuture<T, E> {
        Box::pin(fut)
    }

    #[tokio::test]
    async fn execution_and_publication_runs_factory_once_for_many_concurrent_callers() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();

        let lazy = Arc::new(Lazy::new(
            LazyMode::ExecutionAndPublication,
            move || {
                let invocations = invocations_clone.clone();
                boxed(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, ()>(42u32)
                })
            },
            false,
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lazy = lazy.clone();
            handles.push(tokio::spawn(async move { lazy.get(None).await }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(*value, 42);
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execution_and_publication_with_retry_retries_until_success() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();

        let lazy = Arc::new(Lazy::new(
            LazyMode::ExecutionAndPublicationWithRetry,
            move || {
                let invocations = invocations_clone.clone();
                boxed(async move {
                    let attempt = invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, &'static str>("always fails")?;
                    Ok(attempt as u32)
                })
            },
            false,
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lazy = lazy.clone();
            handles.push(tokio::spawn(async move { lazy.get(None).await }));
        }

        let mut failure_count = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(LazyError::Faulted(_)) => failure_count += 1,
                other => panic!("expected every attempt to fail, got {other:?}"),
            }
        }

        assert_eq!(failure_count, 10);
        let invocation_count = invocations.load(Ordering::SeqCst);
        assert!(
            (2..=10).contains(&invocation_count),
            "expected between 2 and 10 invocations, got {invocation_count}"
        );
        assert!(!lazy.completed_successfully());
        assert!(lazy.is_retryable());
    }

    #[tokio::test]
    async fn publication_only_publishes_exactly_one_success_under_contention() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();

        let lazy = Arc::new(Lazy::new(
            LazyMode::PublicationOnly,
            move || {
                let invocations = invocations_clone.clone();
                boxed(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, ()>(7u32)
                })
            },
            false,
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lazy = lazy.clone();
            handles.push(tokio::spawn(async move { lazy.get(None).await }));
        }

        let mut observed = Vec::new();
        for handle in handles {
            observed.push(Arc::as_ptr(&handle.await.unwrap().unwrap()));
        }

        assert!(observed.windows(2).all(|pair| pair[0] == pair[1]));
        let invocation_count = invocations.load(Ordering::SeqCst);
        assert!(
            (2..=10).contains(&invocation_count),
            "expected between 2 and 10 invocations, got {invocation_count}"
        );
    }

    #[tokio::test]
    async fn none_mode_observes_a_faulted_outcome_permanently() {
        let lazy = Lazy::new(
            LazyMode::None,
            || boxed(async { Err::<u32, &'static str>("boom") }),
            false,
        );

        assert!(matches!(lazy.get(None).await, Err(LazyError::Faulted(_))));
        assert!(lazy.faulted());
        assert!(!lazy.is_retryable());
    }

    #[tokio::test]
    async fn none_with_retry_retries_after_failure() {
        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt_clone = attempt.clone();

        let lazy = Lazy::new(
            LazyMode::NoneWithRetry,
            move || {
                let attempt = attempt_clone.clone();
                boxed(async move {
                    let current = attempt.fetch_add(1, Ordering::SeqCst);
                    if current == 0 {
                        Err("first attempt fails")
                    } else {
                        Ok(current as u32)
                    }
                })
            },
            false,
        );

        assert!(matches!(lazy.get(None).await, Err(LazyError::Faulted(_))));
        assert!(!lazy.value_created());

        let value = lazy.get(None).await.unwrap();
        assert_eq!(*value, 1);
        assert!(lazy.completed_successfully());
    }

    #[tokio::test]
    async fn already_cancelled_token_aborts_without_invoking_factory() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();

        let lazy = Lazy::new(
            LazyMode::ExecutionAndPublication,
            move || {
                let invocations = invocations_clone.clone();
                boxed(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(1u32)
                })
            },
            false,
        );

        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            lazy.get(Some(&token)).await,
            Err(LazyError::Cancelled)
        ));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }
}
