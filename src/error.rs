//! Error handling utils.
//!
//! Every fallible entry point of the crate returns the [`Error`] enum below
//! through the crate-wide [`Result`] alias. Channel completions are *not*
//! errors in this sense: a closed channel is reported through the dedicated
//! result enums in [`fiber::channel`](crate::fiber::channel), which carry the
//! rejected value back to the caller.
//!
//! Scheduler-state invariant violations (a negative spinning count, a run
//! queue past its capacity, a wakeup target in an impossible state) are not
//! represented here either: they indicate memory corruption of the scheduler
//! core and abort the process immediately.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// [`sched::init`](crate::sched::init) was called a second time. The
    /// scheduler is a process-wide singleton and has no shutdown, so there is
    /// nothing to re-initialize.
    #[error("scheduler is already initialized")]
    AlreadyInitialized,

    /// A scheduler entry point was called before [`sched::init`](crate::sched::init).
    #[error("scheduler is not initialized")]
    Uninitialized,

    /// The caller is neither the initial thread nor a fiber, so there is no
    /// processor to act on.
    #[error("operation requires a fiber or the initial thread")]
    NotInFiber,

    /// Processor count outside of `1..=MAX_PROCS`.
    #[error("invalid processor count: {0}")]
    InvalidProcCount(usize),

    /// Stack size below the minimum or not representable on this platform.
    #[error("invalid fiber stack size: {0}")]
    InvalidStackSize(usize),

    /// `mmap`/`mprotect` failed while acquiring a guard-paged fiber stack.
    #[error("failed to allocate fiber stack: {0}")]
    StackAlloc(#[source] io::Error),

    /// The readiness poller could not be created.
    #[error("failed to create poller: {0}")]
    Poller(#[source] io::Error),

    /// One-shot registration of a socket against the poller failed. The
    /// yielding fiber is re-queued as runnable and receives this error
    /// instead of an event mask, so failure can never be confused with
    /// "no events delivered".
    #[error("failed to register socket with the poller: {0}")]
    Register(#[source] io::Error),

    /// Waiting on the poller failed (other than by interruption).
    #[error("poller wait failed: {0}")]
    Poll(#[source] io::Error),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_failure_is_distinct_from_empty_mask() {
        let e = Error::Register(io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(e, Error::Register(_)));
        let msg = e.to_string();
        assert!(msg.contains("register"));
    }
}
