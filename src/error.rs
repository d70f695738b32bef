use miette::Diagnostic;
use thiserror::Error;

/// The error taxonomy shared by every primitive in this crate.
///
/// No variant here is ever retried by a primitive itself -- `Lazy`'s retry
/// modes retry the underlying factory failure, never a [`LockError`].
#[derive(Error, Debug, Diagnostic, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The caller's bound cancellation token fired before the operation
    /// completed. Surfaced only to the specific caller that was cancelled.
    #[error("the operation was cancelled before it completed")]
    Cancelled,

    /// An operation was invoked on a primitive after it was disposed.
    #[error("the primitive has already been disposed")]
    Disposed,

    /// A releaser's `dispose()` was called more than once.
    #[error("dispose() was called more than once on the same releaser")]
    MisuseDoubleRelease,

    /// `Lazy` was asked to operate in a mode it doesn't recognize.
    #[error("Lazy was constructed with an unsupported mode")]
    ModeUnsupported,
}
