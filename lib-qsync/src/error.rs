use thiserror::Error;

/// Failures reported by the synchronizers.
///
/// Timeouts are not errors: timed operations report them as `Ok(false)` or
/// `None`. Contention never surfaces here either, failed CAS attempts are
/// retried in place.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncError {
    /// The calling thread does not hold the lock it tried to release, signal
    /// or wait on, or it presented a stamp that does not match the lock.
    #[error("current thread does not hold the lock")]
    IllegalMonitorState,

    /// A condition created by one synchronizer was handed to another.
    #[error("condition is not owned by this synchronizer")]
    ForeignCondition,

    /// A hold count or permit count would leave its representable range.
    #[error("maximum lock count exceeded")]
    Overflow,

    /// The waiting thread was interrupted before it could acquire.
    #[error("interrupted while waiting")]
    Interrupted,

    /// The policy does not implement the requested acquisition mode.
    #[error("operation not supported by this synchronizer")]
    Unsupported,

    /// A negative count or permit number was supplied.
    #[error("invalid argument: {0}")]
    IllegalArgument(&'static str),
}
