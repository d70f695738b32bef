//! A read-write/read-only cancellation flag with `async` support.
//!
//! This crate is deliberately minimal: it is consumed by synchronization
//! primitives that need to know "has the caller given up waiting yet", and
//! nothing more. It does not know about mutexes, queues, or wakers belonging
//! to any particular primitive.

mod future;
mod registration;
mod token;

pub use future::CancellationTokenFuture;
pub(crate) use future::FutureWaiter;
pub use registration::CancellationRegistration;
pub use token::{CancellationToken, ReadOnlyCancellationToken};
