//! Asynchronous mutex, reader-writer lock, reset events, and a guarded
//! lazy-initialization cell for a cooperative task runtime, sharing a
//! common waiter/cancellation backbone.

mod error;
mod lazy;
mod mutex;
mod queue;
mod reset_event;
mod rwlock;
mod waiter;

pub use error::LockError;
pub use lazy::{Lazy, LazyError, LazyMode};
pub use mutex::{Mutex, MutexReleaser};
pub use reset_event::{AutoResetEvent, ManualResetEvent};
pub use rwlock::{RwLock, RwLockReadReleaser, RwLockWriteReleaser};

pub use cancellation_token::{CancellationRegistration, CancellationToken, ReadOnlyCancellationToken};
