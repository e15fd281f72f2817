//! Cooperative multitasking module.
//!
//! A fiber is a stackful unit of work multiplexed, together with many
//! others, onto a fixed pool of scheduler threads. Fibers never run
//! preemptively: control changes hands only at the explicit suspension
//! points: [`yield_now`], [`wait_io`], channel operations and the
//! [`enter_syscall`]/[`exit_syscall`] pair.
//!
//! A fiber is in exactly one of six states: **idle** (just allocated),
//! **runnable** (queued, not running), **running** (bound to a scheduler
//! thread), **waiting** (parked on a socket or a channel), **syscall**
//! (its thread is off executing a blocking call) or **dead** (returned to
//! the free pool, awaiting reuse).
//!
//! Spawning is cheap: dead fibers are recycled through per-processor free
//! lists and only their register context is rewritten, provided they carry
//! the default stack size. See [`Builder`] for named fibers and custom
//! stack sizes.

use std::cell::{Cell, UnsafeCell};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};

use crate::arch::Context;
use crate::error::{Error, Result};
use crate::poller::Events;
use crate::sched::{self, Worker};
use crate::stack::FiberStack;

pub use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

pub mod channel;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Identity of a spawned fiber. Ids are assigned monotonically and never
/// reused; id 0 is reserved for the per-thread dispatcher context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u64);

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberStatus
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FiberStatus {
    Idle = 0,
    Runnable = 1,
    Running = 2,
    Waiting = 3,
    Syscall = 4,
    Dead = 5,
}

impl FiberStatus {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Waiting,
            4 => Self::Syscall,
            5 => Self::Dead,
            _ => unreachable!("corrupted fiber status {}", v),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// The fiber control block. Never exposed directly: user code holds only
/// [`FiberId`]s and channel handles.
///
/// Concurrency protocol: the `Cell` fields are accessed either by the thread
/// the fiber is running on, or, while the fiber is parked, by the single
/// thread that owns it through a wait list under the respective lock. The
/// status word is the synchronization point: cross-thread wakeups go through
/// a CAS on it, and the subsequent run-queue insertion publishes every prior
/// write with release/acquire ordering.
pub(crate) struct Fiber {
    pub(crate) id: Cell<u64>,
    status: AtomicU8,
    entry: Cell<Option<Box<dyn FnOnce() + Send + 'static>>>,
    pub(crate) ctx: UnsafeCell<Context>,
    stack: FiberStack,
    /// Owning scheduler thread; non-null only while running or in syscall.
    pub(crate) worker: AtomicPtr<Worker>,
    /// Registered socket, `-1` when none.
    pub(crate) wait_fd: Cell<RawFd>,
    pub(crate) interest: Cell<Events>,
    /// Delivered readiness mask, written by the waking thread.
    pub(crate) ready: AtomicU32,
    /// Raw OS error of a failed poller registration, 0 when none.
    pub(crate) register_err: Cell<i32>,
    /// Channel payload in flight (a boxed value owned by whoever holds the
    /// channel lock at rendezvous time).
    pub(crate) xfer: Cell<*mut c_void>,
    /// Whether the channel wait completed with a match (`true`) or a close.
    pub(crate) xfer_ok: Cell<bool>,
    /// Intrusive next pointer; the fiber sits in at most one list at a time.
    pub(crate) link: Cell<*mut Fiber>,
}

// See the concurrency protocol in the struct docs. Fibers travel between
// threads as raw pointers inside queues; the status word serializes access.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Allocate a fresh fiber with a guard-paged stack of `stack_size`
    /// usable bytes. The fiber starts **idle** and is leaked: control
    /// blocks are owned by the scheduler's queues from here on.
    pub(crate) fn alloc(stack_size: usize) -> Result<NonNull<Fiber>> {
        let stack = FiberStack::new(stack_size)?;
        let fiber = Box::new(Fiber {
            id: Cell::new(0),
            status: AtomicU8::new(FiberStatus::Idle as u8),
            entry: Cell::new(None),
            ctx: UnsafeCell::new(Context::default()),
            stack,
            worker: AtomicPtr::new(std::ptr::null_mut()),
            wait_fd: Cell::new(-1),
            interest: Cell::new(Events::empty()),
            ready: AtomicU32::new(0),
            register_err: Cell::new(0),
            xfer: Cell::new(std::ptr::null_mut()),
            xfer_ok: Cell::new(false),
            link: Cell::new(std::ptr::null_mut()),
        });
        // Box never fails to produce a valid pointer.
        Ok(unsafe { NonNull::new_unchecked(Box::into_raw(fiber)) })
    }

    /// Free a control block for good (custom-sized stacks are not recycled).
    pub(crate) unsafe fn release(fiber: NonNull<Fiber>) {
        drop(Box::from_raw(fiber.as_ptr()));
    }

    /// Rewrite the fiber for a new life: fresh identity, fresh entry, a
    /// register context whose first switch lands in the trampoline, and no
    /// wait state left over from the previous incarnation.
    pub(crate) unsafe fn prepare(&self, id: u64, entry: Box<dyn FnOnce() + Send + 'static>) {
        self.id.set(id);
        self.entry.set(Some(entry));
        self.worker.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.wait_fd.set(-1);
        self.interest.set(Events::empty());
        self.ready.store(0, Ordering::Relaxed);
        self.register_err.set(0);
        self.xfer.set(std::ptr::null_mut());
        self.xfer_ok.set(false);
        self.link.set(std::ptr::null_mut());
        Context::init(&mut *self.ctx.get(), self.stack.top(), fiber_main);
        self.set_status(FiberStatus::Runnable);
    }

    #[inline]
    pub(crate) fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_status(&self, status: FiberStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Single-winner status transition; the backbone of cross-thread
    /// wakeups.
    #[inline]
    pub(crate) fn transition(&self, from: FiberStatus, to: FiberStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        self.entry.take()
    }

    /// Whether this control block may go back to a free list.
    #[inline]
    pub(crate) fn recyclable(&self) -> bool {
        self.stack.size() == DEFAULT_STACK_SIZE
    }
}

/// Entry trampoline: the target of the very first switch into a fiber.
/// Runs the user closure and routes completion back to the dispatcher with
/// an unconditional jump; this stack is about to be recycled and must not
/// be saved.
extern "C" fn fiber_main() -> ! {
    let worker = sched::current_worker().expect("fiber running without a scheduler thread");
    let fiber = worker.current_fiber().expect("fiber trampoline entered with no current fiber");
    let entry = unsafe { fiber.as_ref().take_entry() }.expect("fiber started without an entry");

    if catch_unwind(AssertUnwindSafe(entry)).is_err() {
        // There is no joiner to deliver the panic to, and unwinding further
        // would tear through the context-switch boundary.
        log::error!(
            "fiber {} panicked; aborting",
            unsafe { fiber.as_ref().id.get() },
        );
        std::process::abort();
    }

    sched::finish_current(worker)
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The currently
/// supported configurations are:
///
/// * `name`:       an associated name, visible in the scheduler's trace log
/// * `stack_size`: the usable stack size in bytes (validated)
///
/// The [`spawn`](Self::spawn) method consumes the builder and enqueues the
/// fiber as runnable. The [`spawn`](crate::fiber::spawn) free function uses
/// a `Builder` with the default configuration.
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Self {
            name: None,
            stack_size: None,
        }
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    ///
    /// Fibers with a non-default stack size are not recycled through the
    /// free lists; their stack is unmapped when they die.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE || stack_size > isize::MAX as usize / 2 {
            return Err(Error::InvalidStackSize(stack_size));
        }
        self.stack_size = Some(stack_size);
        Ok(self)
    }

    /// Spawns a new fiber by taking ownership of the `Builder`.
    ///
    /// May only be called from the initial thread (between
    /// [`sched::init`](crate::sched::init) and
    /// [`sched::start`](crate::sched::start)) or from within another fiber.
    /// The new fiber is enqueued as runnable; the caller keeps running.
    pub fn spawn<F>(self, f: F) -> Result<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        let s = sched::instance()?;
        let worker = sched::current_worker().ok_or(Error::NotInFiber)?;

        let fiber = match self.stack_size {
            None => match s.take_free_fiber(worker) {
                Some(fiber) => fiber,
                None => Fiber::alloc(DEFAULT_STACK_SIZE)?,
            },
            Some(size) => Fiber::alloc(size)?,
        };

        let id = s.next_fiber_id();
        unsafe {
            fiber.as_ref().prepare(id, Box::new(f));
        }
        log::trace!(
            "spawned fiber {} ({})",
            id,
            self.name.as_deref().unwrap_or("<unnamed>"),
        );
        s.enqueue_spawned(worker, fiber);
        Ok(FiberId(id))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Spawn a fiber with the default configuration. See [`Builder::spawn`].
#[inline]
pub fn spawn<F>(f: F) -> Result<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn(f)
}

/// Reschedule the current fiber at the tail of its processor's run queue
/// and let the dispatcher pick the next one.
///
/// Calling this outside of a fiber (on the dispatcher context, or on a
/// thread the scheduler does not know) is a silent no-op.
#[inline]
pub fn yield_now() {
    sched::yield_current();
}

/// Park the current fiber until `fd` reports one of the `interest` events,
/// and return the delivered mask.
///
/// The socket is armed one-shot and edge-triggered: a wakeup consumes the
/// registration and the next wait re-arms it. Re-entering with a different
/// socket unregisters the previous one. If the poller refuses the
/// registration the fiber stays runnable and the error is returned as
/// [`Error::Register`], distinct from an empty event mask.
#[inline]
pub fn wait_io(fd: RawFd, interest: Events) -> Result<Events> {
    sched::wait_io_current(fd, interest)
}

/// Change the poller interest of a socket while the owning fiber keeps
/// running. `fd < 0` means "this fiber's registered socket".
///
/// An event firing for a running fiber as a result of this re-arm race is
/// tolerated and discarded.
#[inline]
pub fn io_update(fd: RawFd, interest: Events) -> Result<()> {
    sched::io_update_current(fd, interest)
}

/// Drop the poller registration of a socket. `fd < 0` means "this fiber's
/// registered socket". Unknown sockets are ignored.
#[inline]
pub fn io_unregister(fd: RawFd) {
    sched::io_unregister_current(fd);
}

/// Announce that the current fiber is about to perform a blocking syscall.
///
/// The processor is detached from the thread and handed to another thread
/// (or parked idle) so the remaining fibers keep running while this thread
/// blocks. Must be paired with [`exit_syscall`]. A silent no-op outside of
/// a fiber or when the thread has no processor.
#[inline]
pub fn enter_syscall() {
    sched::enter_syscall_current();
}

/// Re-enter the scheduler after a blocking syscall.
///
/// Fast path: re-acquire the processor released by [`enter_syscall`] with a
/// single CAS. Slow path: take any idle processor, or park the fiber on the
/// global run queue and let some other thread resume it.
#[inline]
pub fn exit_syscall() {
    sched::exit_syscall_current();
}

/// Run `f` bracketed by [`enter_syscall`]/[`exit_syscall`].
#[inline]
pub fn blocking<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    enter_syscall();
    let result = f();
    exit_syscall();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_validates_stack_size() {
        assert!(matches!(
            Builder::new().stack_size(1024),
            Err(Error::InvalidStackSize(1024)),
        ));
        assert!(Builder::new().stack_size(MIN_STACK_SIZE).is_ok());
    }

    #[test]
    fn yield_outside_scheduler_is_noop() {
        // Must not panic or touch any scheduler state.
        yield_now();
    }

    #[test]
    fn status_transitions_are_single_winner() {
        let fiber = Fiber::alloc(MIN_STACK_SIZE).unwrap();
        let f = unsafe { fiber.as_ref() };
        assert_eq!(f.status(), FiberStatus::Idle);
        f.set_status(FiberStatus::Waiting);
        assert!(f.transition(FiberStatus::Waiting, FiberStatus::Runnable));
        assert!(!f.transition(FiberStatus::Waiting, FiberStatus::Runnable));
        assert_eq!(f.status(), FiberStatus::Runnable);
        unsafe { Fiber::release(fiber) };
    }
}
