//! The scheduler core.
//!
//! A fixed array of logical [`Processor`]s is multiplexed over a smaller,
//! demand-grown set of OS threads ([`Worker`]s). Each processor owns a
//! lock-free local run queue plus a priority slot for freshly-spawned work;
//! a mutex-protected global FIFO backs them up for fairness, overflow and
//! cross-thread wakeups. Workers that run dry steal half of a victim's
//! queue; workers that cannot even steal release their processor and park.
//!
//! The "spinning" bookkeeping keeps exactly enough threads searching for
//! work: a wakeup is suppressed while somebody is already spinning, and the
//! last spinner to find work wakes a successor if idle processors remain.
//! Whenever runnable work and an idle processor coexist, some thread is
//! therefore spinning or about to dispatch; this is the liveness contract
//! everything else leans on.
//!
//! Every suspension funnels through one mechanism: the yielding fiber
//! stores a *park request* (callback + opaque argument + fiber) on its
//! worker and switches to the worker's dispatch context. The callback runs
//! on the dispatcher's native stack, after the fiber's context is fully
//! saved, and is the only place where wait lists are linked and locks are
//! dropped; a fiber's own stack is never used for scheduler bookkeeping
//! that could outlive its suspension.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use once_cell::sync::OnceCell;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::arch::{self, Context};
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberStatus};
use crate::poller::{Events, PollEvent, Poller, EVENT_BATCH};

pub(crate) mod queue;

use queue::{FiberList, LocalQueue, LOCAL_QUEUE_CAP};

/// Upper bound for [`init`]'s processor count.
pub const MAX_PROCS: usize = 1024;

/// Every this many dispatches the global queue is consulted before the
/// local one, so local-queue producers cannot starve everyone else.
const GLOBAL_QUEUE_INTERVAL: u32 = 61;

/// Work-stealing passes over the processor array; only the last one is
/// allowed to rob a victim's priority slot.
const STEAL_PASSES: usize = 4;

/// Bound of a processor's private free-fiber list.
const FREE_LIST_CAP: usize = 64;

static SCHED: OnceCell<Sched> = OnceCell::new();

thread_local! {
    static WORKER: Cell<*const Worker> = Cell::new(std::ptr::null());
}

/// Abort on a broken scheduler invariant. Silent corruption of the core
/// produces non-local, non-debuggable failures, so detection is fatal.
#[cold]
pub(crate) fn fatal(args: std::fmt::Arguments<'_>) -> ! {
    log::error!("fatal scheduler invariant violation: {}", args);
    std::process::abort();
}

////////////////////////////////////////////////////////////////////////////////
// ParkRequest
////////////////////////////////////////////////////////////////////////////////

/// Callback executed by the dispatcher after a fiber's context is saved.
/// Returns `false` if parking failed; the dispatcher then re-queues the
/// fiber at the priority slot.
pub(crate) type ParkFn = unsafe fn(NonNull<Fiber>, *mut c_void) -> bool;

pub(crate) struct ParkRequest {
    pub(crate) callback: ParkFn,
    pub(crate) arg: *mut c_void,
    pub(crate) fiber: NonNull<Fiber>,
}

////////////////////////////////////////////////////////////////////////////////
// Processor
////////////////////////////////////////////////////////////////////////////////

/// A logical execution slot: at most one worker owns it at a time.
pub(crate) struct Processor {
    pub(crate) id: u32,
    /// Owning worker; null while idle. Claimed with a CAS; this is what
    /// makes the lock-free syscall-exit fast path sound.
    owner: AtomicPtr<Worker>,
    /// Guarded by the scheduler mutex; prevents a stale idle-stack entry
    /// from being pushed a second time.
    in_idle: Cell<bool>,
    runq: LocalQueue,
    /// Priority slot: the next fiber to run, LIFO. Filled by the owner,
    /// CAS-stolen by anyone.
    next_slot: AtomicPtr<Fiber>,
    /// Recycled fibers, owner access only.
    free: UnsafeCell<Vec<NonNull<Fiber>>>,
    tick: Cell<u32>,
}

// Cell/UnsafeCell fields are only touched by the thread that currently owns
// the processor (or under the scheduler mutex for `in_idle`); everything
// else is atomic.
unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Processor {
    fn new(id: usize) -> Self {
        Self {
            id: id as u32,
            owner: AtomicPtr::new(null_mut()),
            in_idle: Cell::new(false),
            runq: LocalQueue::new(),
            next_slot: AtomicPtr::new(null_mut()),
            free: UnsafeCell::new(Vec::with_capacity(FREE_LIST_CAP)),
            tick: Cell::new(0),
        }
    }

    #[inline]
    fn has_work(&self) -> bool {
        !self.runq.is_empty() || !self.next_slot.load(Ordering::Acquire).is_null()
    }

    /// Enqueue on this processor. Owner thread only. With `lifo` the fiber
    /// lands in the priority slot, displacing its previous occupant into
    /// the ring.
    fn push_local(&self, s: &'static Sched, fiber: NonNull<Fiber>, lifo: bool) {
        let mut fiber = fiber;
        if lifo {
            let prev = self.next_slot.swap(fiber.as_ptr(), Ordering::AcqRel);
            match NonNull::new(prev) {
                None => return,
                Some(displaced) => fiber = displaced,
            }
        }
        loop {
            match self.runq.push_back(fiber) {
                Ok(()) => return,
                Err(f) => {
                    if self.push_overflow(s, f) {
                        return;
                    }
                    // A thief beat the overflow CAS; the ring has room now.
                }
            }
        }
    }

    /// Move half of the ring plus `fiber` to the global queue. The batch is
    /// shuffled first: a same-producer spike would otherwise come back in
    /// one clump and defeat the fairness the global queue exists for.
    fn push_overflow(&self, s: &'static Sched, fiber: NonNull<Fiber>) -> bool {
        let mut batch = Vec::with_capacity(LOCAL_QUEUE_CAP / 2 + 1);
        if !self.runq.grab_half(&mut batch) {
            return false;
        }
        batch.push(fiber);
        batch.shuffle(&mut rand::thread_rng());
        let moved = batch.len();
        let mut shared = s.lock_shared();
        for f in batch {
            shared.runq.push_back(f);
        }
        s.publish_global_len(&shared);
        drop(shared);
        log::debug!(
            "processor {}: local queue overflow, {} fibers moved to the global queue",
            self.id,
            moved,
        );
        true
    }

    /// Owner-side dequeue: priority slot first, then the ring head.
    fn pop_local(&self) -> Option<NonNull<Fiber>> {
        self.take_next().or_else(|| self.runq.pop())
    }

    #[inline]
    fn take_next(&self) -> Option<NonNull<Fiber>> {
        NonNull::new(self.next_slot.swap(null_mut(), Ordering::AcqRel))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Worker
////////////////////////////////////////////////////////////////////////////////

/// A scheduler-bound OS thread. The worker's "scheduler fiber" is simply
/// the dispatch loop running on the thread's native stack; `sched_ctx` is
/// where its register state lives while a fiber runs.
pub(crate) struct Worker {
    pub(crate) id: u32,
    sched_ctx: UnsafeCell<Context>,
    proc: AtomicPtr<Processor>,
    current: Cell<*mut Fiber>,
    park: Cell<Option<ParkRequest>>,
    spinning: AtomicBool,
    /// Processor released by `enter_syscall`, for the CAS fast re-acquire.
    syscall_proc: Cell<*mut Processor>,
    /// Thread parking: flag + condvar, so a wake that lands before the
    /// sleep is never lost.
    wake_pending: Mutex<bool>,
    wakeup: Condvar,
}

// Cell fields are only touched by the worker's own thread; cross-thread
// interaction goes through the atomics and the wake mutex.
unsafe impl Sync for Worker {}

impl Worker {
    fn alloc(id: u32) -> &'static Worker {
        Box::leak(Box::new(Worker {
            id,
            sched_ctx: UnsafeCell::new(Context::default()),
            proc: AtomicPtr::new(null_mut()),
            current: Cell::new(null_mut()),
            park: Cell::new(None),
            spinning: AtomicBool::new(false),
            syscall_proc: Cell::new(null_mut()),
            wake_pending: Mutex::new(false),
            wakeup: Condvar::new(),
        }))
    }

    #[inline]
    pub(crate) fn current_fiber(&self) -> Option<NonNull<Fiber>> {
        NonNull::new(self.current.get())
    }

    #[inline]
    pub(crate) fn processor(&self) -> Option<&'static Processor> {
        unsafe { self.proc.load(Ordering::Acquire).as_ref() }
    }

    /// Store the park request and hand control to the dispatcher. Returns
    /// when the fiber is resumed.
    pub(crate) fn yield_with(&self, req: ParkRequest) {
        let fiber = req.fiber;
        self.park.set(Some(req));
        unsafe {
            arch::switch((*fiber.as_ptr()).ctx.get(), self.sched_ctx.get());
        }
    }

    fn dispatch_loop(&'static self, s: &'static Sched) -> ! {
        loop {
            if self.proc.load(Ordering::Acquire).is_null() {
                self.acquire_proc_or_park(s);
                continue;
            }
            let fiber = match self.find_runnable(s) {
                Some(fiber) => fiber,
                None => continue,
            };
            if self.spinning.load(Ordering::Relaxed) {
                self.stop_spinning(s);
            }
            self.run_fiber(s, fiber);
        }
    }

    /// Dispatch one fiber and absorb its suspension.
    fn run_fiber(&'static self, s: &'static Sched, fiber: NonNull<Fiber>) {
        let f = unsafe { fiber.as_ref() };
        f.set_status(FiberStatus::Running);
        f.worker
            .store(self as *const Worker as *mut Worker, Ordering::Relaxed);
        self.current.set(fiber.as_ptr());
        if let Some(p) = self.processor() {
            p.tick.set(p.tick.get().wrapping_add(1));
        }

        unsafe {
            arch::switch(self.sched_ctx.get(), (*fiber.as_ptr()).ctx.get());
        }

        // Back on the native stack: the fiber yielded, parked or finished.
        self.current.set(null_mut());
        f.worker.store(null_mut(), Ordering::Relaxed);
        if let Some(req) = self.park.take() {
            let parked = unsafe { (req.callback)(req.fiber, req.arg) };
            if !parked {
                // Parking failed: the fiber goes straight back to the
                // front of the line.
                unsafe { req.fiber.as_ref() }.set_status(FiberStatus::Runnable);
                match self.processor() {
                    Some(p) => p.push_local(s, req.fiber, true),
                    None => s.global_push_one(req.fiber),
                }
            }
        }
    }

    /// The ordered hunt for a runnable fiber. `None` means the processor
    /// was released and the worker parked (or must retry).
    fn find_runnable(&'static self, s: &'static Sched) -> Option<NonNull<Fiber>> {
        let p = match self.processor() {
            Some(p) => p,
            None => return None,
        };

        // Fairness: a processor feeding itself from its own queue must
        // still look at the global queue now and then.
        if p.tick.get() % GLOBAL_QUEUE_INTERVAL == 0 && s.global_len.load(Ordering::SeqCst) > 0 {
            if let Some(fiber) = s.global_pop_batched(p) {
                return Some(fiber);
            }
        }

        if let Some(fiber) = p.pop_local() {
            return Some(fiber);
        }

        if s.global_len.load(Ordering::SeqCst) > 0 {
            if let Some(fiber) = s.global_pop_batched(p) {
                return Some(fiber);
            }
        }

        if let Some(fiber) = s.poll_ready() {
            return Some(fiber);
        }

        if self.spinning.load(Ordering::Relaxed) || s.spin_allowed() {
            if !self.spinning.load(Ordering::Relaxed) {
                self.spinning.store(true, Ordering::Relaxed);
                s.spinning.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(fiber) = self.steal_work(s, p) {
                return Some(fiber);
            }
        }

        self.release_and_park(s);
        None
    }

    /// Bounded stealing: several passes over the processors in a random
    /// starting order; the final pass may take a victim's priority slot.
    fn steal_work(&self, s: &'static Sched, me: &Processor) -> Option<NonNull<Fiber>> {
        let n = s.procs.len();
        if n < 2 {
            return None;
        }
        let mut rng = rand::thread_rng();
        for pass in 0..STEAL_PASSES {
            let start = rng.gen_range(0..n);
            for i in 0..n {
                let victim = &s.procs[(start + i) % n];
                if std::ptr::eq(victim, me) {
                    continue;
                }
                if let Some(fiber) = victim.runq.steal_into(&me.runq) {
                    log::trace!(
                        "worker {} stole work from processor {}",
                        self.id,
                        victim.id,
                    );
                    return Some(fiber);
                }
                if pass == STEAL_PASSES - 1 {
                    if let Some(fiber) = victim.take_next() {
                        return Some(fiber);
                    }
                }
            }
        }
        None
    }

    fn stop_spinning(&self, s: &'static Sched) {
        self.spinning.store(false, Ordering::Relaxed);
        let prev = s.spinning.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            fatal(format_args!("spinning count went negative"));
        }
        // The last spinner found work: if idle processors remain, somebody
        // else must take over the search or new work could stall.
        if prev == 1 && s.idle_proc_count.load(Ordering::SeqCst) > 0 {
            s.wake_proc();
        }
    }

    /// Give up the processor and park the thread. The global queue and all
    /// local queues are rechecked under the lock first, closing the window
    /// against a producer that pushed between our failed steals and here.
    fn release_and_park(&'static self, s: &'static Sched) {
        let mut shared = s.lock_shared();

        if let Some(p) = self.detach_proc() {
            s.pidle_put_locked(&mut shared, p);
        }
        if self.spinning.load(Ordering::Relaxed) {
            self.spinning.store(false, Ordering::Relaxed);
            let prev = s.spinning.fetch_sub(1, Ordering::SeqCst);
            if prev == 0 {
                fatal(format_args!("spinning count went negative"));
            }
        }

        let missed_work =
            !shared.runq.is_empty() || s.procs.iter().any(|p| p.has_work());
        if missed_work {
            if let Some(p) = s.pidle_pop_locked(&mut shared, self) {
                self.proc.store(p.as_ptr(), Ordering::Release);
                self.spinning.store(true, Ordering::Relaxed);
                s.spinning.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }

        shared.idle_workers.push(self);
        drop(shared);
        log::trace!("worker {} parked", self.id);
        self.sleep_until_woken();
        log::trace!("worker {} unparked", self.id);
    }

    /// A worker with no processor (fresh wake, or back from the syscall
    /// slow path): grab an idle processor or go to sleep.
    fn acquire_proc_or_park(&'static self, s: &'static Sched) {
        let mut shared = s.lock_shared();
        if let Some(p) = s.pidle_pop_locked(&mut shared, self) {
            self.proc.store(p.as_ptr(), Ordering::Release);
            return;
        }
        shared.idle_workers.push(self);
        drop(shared);
        self.sleep_until_woken();
    }

    fn detach_proc(&self) -> Option<NonNull<Processor>> {
        let p = NonNull::new(self.proc.swap(null_mut(), Ordering::AcqRel))?;
        unsafe {
            p.as_ref().owner.store(null_mut(), Ordering::Release);
        }
        Some(p)
    }

    fn sleep_until_woken(&self) {
        let mut pending = self
            .wake_pending
            .lock()
            .expect("worker wake mutex was poisoned");
        while !*pending {
            pending = self
                .wakeup
                .wait(pending)
                .expect("worker wake mutex was poisoned");
        }
        *pending = false;
    }

    fn wake(&self) {
        let mut pending = self
            .wake_pending
            .lock()
            .expect("worker wake mutex was poisoned");
        *pending = true;
        self.wakeup.notify_one();
    }
}

fn worker_main(s: &'static Sched, worker: &'static Worker) {
    WORKER.with(|w| w.set(worker));
    log::debug!("worker {} started", worker.id);
    worker.dispatch_loop(s)
}

////////////////////////////////////////////////////////////////////////////////
// Sched
////////////////////////////////////////////////////////////////////////////////

/// State behind the scheduler mutex.
struct Shared {
    /// Global FIFO run queue.
    runq: FiberList,
    /// Idle processors, used as a stack. Entries can go stale when the
    /// syscall-exit fast path claims a processor by CAS; `in_idle` plus the
    /// claim CAS in `pidle_pop_locked` make staleness harmless.
    idle_procs: Vec<NonNull<Processor>>,
    idle_workers: Vec<&'static Worker>,
    free_fibers: FiberList,
}

// Raw pointers whose referents are 'static and whose queue membership is
// guarded by the mutex this struct lives in.
unsafe impl Send for Shared {}

pub(crate) struct Sched {
    procs: Box<[Processor]>,
    poller: Poller,
    shared: Mutex<Shared>,
    /// Number of workers currently spinning. The wake/park protocol keeps
    /// this equal to the sum of the workers' spinning flags.
    spinning: AtomicUsize,
    /// Mirror of `shared.idle_procs.len()`, readable without the lock.
    idle_proc_count: AtomicUsize,
    /// Mirror of `shared.runq.len()`, readable without the lock.
    global_len: AtomicUsize,
    next_fiber: AtomicU64,
    next_worker: AtomicU32,
    workers: AtomicUsize,
    free_count: AtomicUsize,
    recycled: AtomicU64,
}

/// The CAS sentinel marking a processor that has been popped from the idle
/// stack but not yet assigned to its worker.
#[inline]
fn reserved_owner() -> *mut Worker {
    1 as *mut Worker
}

impl Sched {
    #[inline]
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("scheduler mutex was poisoned")
    }

    #[inline]
    fn publish_global_len(&self, shared: &Shared) {
        self.global_len.store(shared.runq.len(), Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn next_fiber_id(&self) -> u64 {
        self.next_fiber.fetch_add(1, Ordering::Relaxed)
    }

    fn global_push_one(&self, fiber: NonNull<Fiber>) {
        let mut shared = self.lock_shared();
        shared.runq.push_back(fiber);
        self.publish_global_len(&shared);
    }

    /// Dequeue one fiber from the global queue and, when the caller's local
    /// ring just drained, batch a few more over so the mutex is not taken
    /// once per fiber.
    fn global_pop_batched(&self, p: &Processor) -> Option<NonNull<Fiber>> {
        let mut shared = self.lock_shared();
        let first = shared.runq.pop_front()?;
        if p.runq.is_empty() {
            let max = std::cmp::min(self.procs.len(), LOCAL_QUEUE_CAP / 2);
            for _ in 0..max {
                let fiber = match shared.runq.pop_front() {
                    Some(fiber) => fiber,
                    None => break,
                };
                if let Err(fiber) = p.runq.push_back(fiber) {
                    shared.runq.push_back(fiber);
                    break;
                }
            }
        }
        self.publish_global_len(&shared);
        Some(first)
    }

    fn pidle_put_locked(&self, shared: &mut Shared, p: NonNull<Processor>) {
        let pr = unsafe { p.as_ref() };
        if !pr.in_idle.get() {
            pr.in_idle.set(true);
            shared.idle_procs.push(p);
            self.idle_proc_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Pop and claim an idle processor for `worker`. Stale entries (already
    /// grabbed through the syscall-exit fast path) are discarded.
    fn pidle_pop_locked(
        &self,
        shared: &mut Shared,
        worker: &'static Worker,
    ) -> Option<NonNull<Processor>> {
        while let Some(p) = shared.idle_procs.pop() {
            let pr = unsafe { p.as_ref() };
            pr.in_idle.set(false);
            self.idle_proc_count.fetch_sub(1, Ordering::SeqCst);
            if pr
                .owner
                .compare_exchange(
                    null_mut(),
                    worker as *const Worker as *mut Worker,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(p);
            }
        }
        None
    }

    #[inline]
    fn spin_allowed(&self) -> bool {
        let busy = self
            .procs
            .len()
            .saturating_sub(self.idle_proc_count.load(Ordering::SeqCst));
        2 * self.spinning.load(Ordering::SeqCst) < busy.max(1)
    }

    /// Ensure somebody will look for the work that just appeared: start or
    /// wake one spinning worker, unless a spinner already exists or no
    /// processor is idle.
    pub(crate) fn wake_proc(&'static self) {
        if self.spinning.load(Ordering::SeqCst) > 0 {
            return;
        }
        if self
            .spinning
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut shared = self.lock_shared();
        let p = loop {
            match shared.idle_procs.pop() {
                None => {
                    drop(shared);
                    let prev = self.spinning.fetch_sub(1, Ordering::SeqCst);
                    if prev == 0 {
                        fatal(format_args!("spinning count went negative"));
                    }
                    return;
                }
                Some(p) => {
                    let pr = unsafe { p.as_ref() };
                    pr.in_idle.set(false);
                    self.idle_proc_count.fetch_sub(1, Ordering::SeqCst);
                    if pr
                        .owner
                        .compare_exchange(
                            null_mut(),
                            reserved_owner(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break p;
                    }
                    // Stale entry: the fast exit-syscall path owns it now.
                }
            }
        };

        if let Some(worker) = shared.idle_workers.pop() {
            unsafe {
                p.as_ref().owner.store(
                    worker as *const Worker as *mut Worker,
                    Ordering::Release,
                );
            }
            worker.spinning.store(true, Ordering::Relaxed);
            worker.proc.store(p.as_ptr(), Ordering::Release);
            drop(shared);
            worker.wake();
        } else {
            drop(shared);
            self.spawn_worker(p, true);
        }
    }

    /// Hand an unowned processor that is known to have work to a thread.
    fn start_worker_for(&'static self, p: NonNull<Processor>) {
        let mut shared = self.lock_shared();
        if let Some(worker) = shared.idle_workers.pop() {
            unsafe {
                p.as_ref().owner.store(
                    worker as *const Worker as *mut Worker,
                    Ordering::Release,
                );
            }
            worker.proc.store(p.as_ptr(), Ordering::Release);
            drop(shared);
            worker.wake();
        } else {
            drop(shared);
            self.spawn_worker(p, false);
        }
    }

    fn spawn_worker(&'static self, p: NonNull<Processor>, spinning: bool) {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::alloc(id);
        unsafe {
            p.as_ref().owner.store(
                worker as *const Worker as *mut Worker,
                Ordering::Release,
            );
        }
        worker.spinning.store(spinning, Ordering::Relaxed);
        worker.proc.store(p.as_ptr(), Ordering::Release);
        self.workers.fetch_add(1, Ordering::Relaxed);

        let s: &'static Sched = self;
        let spawned = std::thread::Builder::new()
            .name(format!("filament-worker-{}", id))
            .spawn(move || worker_main(s, worker));
        if let Err(e) = spawned {
            fatal(format_args!("failed to spawn a scheduler thread: {}", e));
        }
        log::debug!(
            "worker {} spawned for processor {}",
            id,
            unsafe { p.as_ref().id },
        );
    }

    /// Syscall handoff policy: a released processor with pending work gets a
    /// thread immediately; otherwise it goes idle and, if nobody is
    /// searching, a spinning thread is started to cover the gap.
    fn handoff(&'static self, p: NonNull<Processor>) {
        let pr = unsafe { p.as_ref() };
        if pr.has_work() || self.global_len.load(Ordering::SeqCst) > 0 {
            log::trace!("syscall handoff: restarting processor {}", pr.id);
            self.start_worker_for(p);
            return;
        }
        let mut shared = self.lock_shared();
        self.pidle_put_locked(&mut shared, p);
        drop(shared);
        if self.spinning.load(Ordering::SeqCst) == 0 {
            self.wake_proc();
        }
    }

    /// Non-blocking poll from the dispatcher: the first woken fiber is
    /// dispatched directly, the rest go to the global queue.
    fn poll_ready(&'static self) -> Option<NonNull<Fiber>> {
        let mut buf = [PollEvent {
            events: Events::empty(),
            token: 0,
        }; EVENT_BATCH];
        let n = match self.poller.wait(&mut buf, 0) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("dispatcher poll failed: {}", e);
                return None;
            }
        };
        let mut first = None;
        let mut extra = 0;
        for ev in &buf[..n] {
            let fiber = match self.claim_waiting(ev) {
                Some(fiber) => fiber,
                None => continue,
            };
            if first.is_none() {
                first = Some(fiber);
            } else {
                self.global_push_one(fiber);
                extra += 1;
            }
        }
        if extra > 0 {
            self.wake_proc();
        }
        first
    }

    /// Map a delivered event back to its fiber. Only a fiber still in the
    /// waiting state may be woken; one-shot registration makes anything
    /// else a stray (e.g. an `io_update` re-arm race) to be discarded.
    fn claim_waiting(&self, ev: &PollEvent) -> Option<NonNull<Fiber>> {
        let fiber = NonNull::new(ev.token as *mut Fiber)?;
        let f = unsafe { fiber.as_ref() };
        if !f.transition(FiberStatus::Waiting, FiberStatus::Runnable) {
            log::trace!(
                "discarding event {:?} for non-waiting fiber {}",
                ev.events,
                f.id.get(),
            );
            return None;
        }
        f.ready.store(ev.events.bits(), Ordering::Release);
        Some(fiber)
    }

    /// Fetch a recycled fiber: the worker's processor-local pool first,
    /// then the global one.
    pub(crate) fn take_free_fiber(&self, worker: &Worker) -> Option<NonNull<Fiber>> {
        if let Some(p) = worker.processor() {
            let free = unsafe { &mut *p.free.get() };
            if let Some(fiber) = free.pop() {
                return Some(fiber);
            }
        }
        if self.free_count.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let mut shared = self.lock_shared();
        let fiber = shared.free_fibers.pop_front();
        self.free_count
            .store(shared.free_fibers.len(), Ordering::Relaxed);
        fiber
    }

    /// Return a dead fiber to a free pool (or unmap a custom-sized stack).
    fn recycle(&self, fiber: NonNull<Fiber>) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
        if !unsafe { fiber.as_ref() }.recyclable() {
            unsafe { Fiber::release(fiber) };
            return;
        }
        if let Some(worker) = current_worker() {
            if let Some(p) = worker.processor() {
                let free = unsafe { &mut *p.free.get() };
                if free.len() < FREE_LIST_CAP {
                    free.push(fiber);
                    return;
                }
            }
        }
        let mut shared = self.lock_shared();
        shared.free_fibers.push_back(fiber);
        self.free_count
            .store(shared.free_fibers.len(), Ordering::Relaxed);
    }

    /// Enqueue a freshly-spawned fiber and make sure somebody will run it.
    pub(crate) fn enqueue_spawned(&'static self, worker: &Worker, fiber: NonNull<Fiber>) {
        match worker.processor() {
            Some(p) => {
                // A spawning fiber prefers the LIFO slot for locality; the
                // initial thread (no current fiber yet) enqueues FIFO so
                // that start order equals dispatch order.
                let lifo = !worker.current.get().is_null();
                p.push_local(self, fiber, lifo);
            }
            None => self.global_push_one(fiber),
        }
        self.wake_proc();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Park callbacks
////////////////////////////////////////////////////////////////////////////////

unsafe fn park_yield(fiber: NonNull<Fiber>, _arg: *mut c_void) -> bool {
    let s = sched_ref();
    fiber.as_ref().set_status(FiberStatus::Runnable);
    match current_worker().and_then(Worker::processor) {
        Some(p) => p.push_local(s, fiber, false),
        None => s.global_push_one(fiber),
    }
    true
}

unsafe fn park_io(fiber: NonNull<Fiber>, arg: *mut c_void) -> bool {
    let s = sched_ref();
    let f = fiber.as_ref();
    let fd = arg as isize as RawFd;

    let prev = f.wait_fd.get();
    if prev >= 0 && prev != fd {
        s.poller.deregister(prev);
    }
    f.wait_fd.set(fd);
    // Waiting must be published before the registration: with a one-shot
    // arm the very first event may fire on another thread immediately, and
    // the wakeup CAS has to observe the final state. Nothing below touches
    // the fiber after a successful arm.
    f.set_status(FiberStatus::Waiting);
    match s.poller.register(fd, fiber.as_ptr() as u64, f.interest.get()) {
        Ok(()) => true,
        Err(e) => {
            f.wait_fd.set(-1);
            f.register_err.set(e.raw_os_error().unwrap_or(libc::EIO));
            false
        }
    }
}

unsafe fn park_finish(fiber: NonNull<Fiber>, _arg: *mut c_void) -> bool {
    let s = sched_ref();
    let f = fiber.as_ref();
    let fd = f.wait_fd.get();
    if fd >= 0 {
        s.poller.deregister(fd);
        f.wait_fd.set(-1);
    }
    f.set_status(FiberStatus::Dead);
    log::trace!("fiber {} finished", f.id.get());
    s.recycle(fiber);
    true
}

unsafe fn park_exit_syscall(fiber: NonNull<Fiber>, _arg: *mut c_void) -> bool {
    let s = sched_ref();
    fiber.as_ref().set_status(FiberStatus::Runnable);
    s.global_push_one(fiber);
    s.wake_proc();
    true
}

////////////////////////////////////////////////////////////////////////////////
// Crate-internal entry points
////////////////////////////////////////////////////////////////////////////////

#[inline]
pub(crate) fn instance() -> Result<&'static Sched> {
    SCHED.get().ok_or(Error::Uninitialized)
}

#[inline]
fn sched_ref() -> &'static Sched {
    SCHED.get().expect("scheduler is not initialized")
}

#[inline]
pub(crate) fn current_worker() -> Option<&'static Worker> {
    WORKER.with(|w| unsafe { w.get().as_ref() })
}

pub(crate) fn yield_current() {
    let worker = match current_worker() {
        Some(worker) => worker,
        None => return,
    };
    let fiber = match worker.current_fiber() {
        Some(fiber) => fiber,
        // The dispatcher context: nothing to yield.
        None => return,
    };
    worker.yield_with(ParkRequest {
        callback: park_yield,
        arg: null_mut(),
        fiber,
    });
}

pub(crate) fn wait_io_current(fd: RawFd, interest: Events) -> Result<Events> {
    instance()?;
    let worker = current_worker().ok_or(Error::NotInFiber)?;
    let fiber = worker.current_fiber().ok_or(Error::NotInFiber)?;
    let f = unsafe { fiber.as_ref() };
    f.interest.set(interest);
    f.register_err.set(0);
    f.ready.store(0, Ordering::Release);
    worker.yield_with(ParkRequest {
        callback: park_io,
        arg: fd as isize as *mut c_void,
        fiber,
    });
    let err = f.register_err.get();
    if err != 0 {
        return Err(Error::Register(io::Error::from_raw_os_error(err)));
    }
    Ok(Events::from_bits_truncate(f.ready.load(Ordering::Acquire)))
}

pub(crate) fn io_update_current(fd: RawFd, interest: Events) -> Result<()> {
    let s = instance()?;
    let worker = current_worker().ok_or(Error::NotInFiber)?;
    let fiber = worker.current_fiber().ok_or(Error::NotInFiber)?;
    let f = unsafe { fiber.as_ref() };
    let fd = if fd < 0 { f.wait_fd.get() } else { fd };
    if fd < 0 {
        return Ok(());
    }
    let prev = f.wait_fd.get();
    if prev >= 0 && prev != fd {
        s.poller.deregister(prev);
    }
    f.interest.set(interest);
    f.wait_fd.set(fd);
    s.poller
        .update(fd, fiber.as_ptr() as u64, interest)
        .map_err(Error::Register)
}

pub(crate) fn io_unregister_current(fd: RawFd) {
    let s = match instance() {
        Ok(s) => s,
        Err(_) => return,
    };
    let worker = match current_worker() {
        Some(worker) => worker,
        None => return,
    };
    let fiber = match worker.current_fiber() {
        Some(fiber) => fiber,
        None => return,
    };
    let f = unsafe { fiber.as_ref() };
    let fd = if fd < 0 { f.wait_fd.get() } else { fd };
    if fd < 0 {
        return;
    }
    s.poller.deregister(fd);
    if f.wait_fd.get() == fd {
        f.wait_fd.set(-1);
    }
}

pub(crate) fn enter_syscall_current() {
    let s = match SCHED.get() {
        Some(s) => s,
        None => return,
    };
    let worker = match current_worker() {
        Some(worker) => worker,
        None => return,
    };
    let fiber = match worker.current_fiber() {
        Some(fiber) => fiber,
        None => return,
    };
    let f = unsafe { fiber.as_ref() };
    f.set_status(FiberStatus::Syscall);
    let p = match NonNull::new(worker.proc.swap(null_mut(), Ordering::AcqRel)) {
        Some(p) => p,
        None => {
            // No processor to hand off: documented no-op.
            f.set_status(FiberStatus::Running);
            return;
        }
    };
    unsafe {
        p.as_ref().owner.store(null_mut(), Ordering::Release);
    }
    worker.syscall_proc.set(p.as_ptr());
    log::trace!(
        "fiber {}: entering syscall, processor {} released",
        f.id.get(),
        unsafe { p.as_ref().id },
    );
    s.handoff(p);
}

pub(crate) fn exit_syscall_current() {
    let s = match SCHED.get() {
        Some(s) => s,
        None => return,
    };
    let worker = match current_worker() {
        Some(worker) => worker,
        None => return,
    };
    let fiber = match worker.current_fiber() {
        Some(fiber) => fiber,
        None => return,
    };
    let f = unsafe { fiber.as_ref() };
    if f.status() != FiberStatus::Syscall {
        // Unpaired exit: documented no-op.
        return;
    }

    // Fast path: win the released processor back with one CAS, no locks.
    let saved = worker.syscall_proc.get();
    worker.syscall_proc.set(null_mut());
    if let Some(p) = NonNull::new(saved) {
        if unsafe { p.as_ref() }
            .owner
            .compare_exchange(
                null_mut(),
                worker as *const Worker as *mut Worker,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            worker.proc.store(p.as_ptr(), Ordering::Release);
            f.set_status(FiberStatus::Running);
            log::trace!("fiber {}: fast syscall exit", f.id.get());
            return;
        }
    }

    // Slow path: any idle processor will do.
    {
        let mut shared = s.lock_shared();
        if let Some(p) = s.pidle_pop_locked(&mut shared, worker) {
            worker.proc.store(p.as_ptr(), Ordering::Release);
            f.set_status(FiberStatus::Running);
            return;
        }
    }

    // No processor anywhere: the fiber joins the global queue and this
    // thread re-enters the dispatcher (which will park it).
    log::trace!("fiber {}: slow syscall exit, requeueing", f.id.get());
    worker.yield_with(ParkRequest {
        callback: park_exit_syscall,
        arg: null_mut(),
        fiber,
    });
}

/// Fiber completion: publish the recycle request and jump to the dispatcher
/// without saving this stack, which is about to be reused.
pub(crate) fn finish_current(worker: &'static Worker) -> ! {
    let fiber = worker
        .current_fiber()
        .expect("fiber completion without a current fiber");
    worker.park.set(Some(ParkRequest {
        callback: park_finish,
        arg: null_mut(),
        fiber,
    }));
    unsafe { arch::jump(worker.sched_ctx.get()) }
}

/// Drop a fiber's socket registration, if any. Channel parking calls this
/// so a fiber can never wait on a socket and a channel at once: a stray
/// one-shot event arriving mid-channel-wait would otherwise race the
/// channel wakeup for the same status transition.
pub(crate) fn clear_io_wait(fiber: &Fiber) {
    let s = match SCHED.get() {
        Some(s) => s,
        None => return,
    };
    let fd = fiber.wait_fd.get();
    if fd >= 0 {
        s.poller.deregister(fd);
        fiber.wait_fd.set(-1);
    }
}

/// Wake a fiber parked on a channel. The caller holds the channel mutex and
/// has already unlinked the fiber from the wait list, so the fiber must be
/// in the waiting state; anything else is corruption.
pub(crate) fn ready_from_channel(fiber: NonNull<Fiber>) {
    let s = sched_ref();
    let f = unsafe { fiber.as_ref() };
    if !f.transition(FiberStatus::Waiting, FiberStatus::Runnable) {
        fatal(format_args!(
            "channel wakeup for fiber {} in state {:?}",
            f.id.get(),
            f.status(),
        ));
    }
    match current_worker().and_then(Worker::processor) {
        Some(p) => p.push_local(s, fiber, true),
        None => s.global_push_one(fiber),
    }
    s.wake_proc();
}

////////////////////////////////////////////////////////////////////////////////
// Public surface
////////////////////////////////////////////////////////////////////////////////

/// One-shot scheduler initialization.
///
/// Creates `proc_count` logical processors and the readiness poller, and
/// binds processor 0 to the calling thread, which becomes the *initial
/// thread*: it may [`spawn`](crate::fiber::spawn) fibers and must
/// eventually call [`start`]. Re-initialization fails with
/// [`Error::AlreadyInitialized`].
pub fn init(proc_count: usize) -> Result<()> {
    if proc_count == 0 || proc_count > MAX_PROCS {
        return Err(Error::InvalidProcCount(proc_count));
    }
    let poller = Poller::new()?;
    let procs: Box<[Processor]> = (0..proc_count).map(Processor::new).collect();
    let sched = Sched {
        procs,
        poller,
        shared: Mutex::new(Shared {
            runq: FiberList::new(),
            idle_procs: Vec::with_capacity(proc_count),
            idle_workers: Vec::new(),
            free_fibers: FiberList::new(),
        }),
        spinning: AtomicUsize::new(0),
        idle_proc_count: AtomicUsize::new(0),
        global_len: AtomicUsize::new(0),
        next_fiber: AtomicU64::new(1),
        next_worker: AtomicU32::new(1),
        workers: AtomicUsize::new(1),
        free_count: AtomicUsize::new(0),
        recycled: AtomicU64::new(0),
    };
    let s = match SCHED.set(sched) {
        Ok(()) => SCHED.get().expect("just set"),
        Err(_) => return Err(Error::AlreadyInitialized),
    };

    let worker = Worker::alloc(0);
    WORKER.with(|w| w.set(worker));
    let p0 = &s.procs[0];
    p0.owner.store(
        worker as *const Worker as *mut Worker,
        Ordering::Release,
    );
    worker.proc.store(
        p0 as *const Processor as *mut Processor,
        Ordering::Release,
    );

    let mut shared = s.lock_shared();
    for p in &s.procs[1..] {
        p.in_idle.set(true);
        shared.idle_procs.push(NonNull::from(p));
    }
    s.idle_proc_count
        .store(shared.idle_procs.len(), Ordering::SeqCst);
    drop(shared);

    log::info!("scheduler initialized with {} processors", proc_count);
    Ok(())
}

/// Convert the calling thread into a scheduler thread and run the
/// dispatcher. Never returns: the scheduler has no shutdown.
///
/// # Panics
///
/// Panics if [`init`] has not been called, or if the caller is not the
/// thread that called it.
pub fn start() -> ! {
    let s = SCHED
        .get()
        .expect("sched::start: the scheduler is not initialized");
    let worker = current_worker()
        .expect("sched::start must be called on the thread that called sched::init");
    log::debug!("worker {} entering the dispatch loop", worker.id);
    worker.dispatch_loop(s)
}

/// Drive the poller from outside the scheduler. Intended for a dedicated
/// helper thread: when every scheduler thread is parked, network readiness
/// must still be able to wake fibers up.
///
/// `timeout_ms = 0` polls without blocking, `-1` blocks until at least one
/// event or an interrupt. Returns the number of fibers woken.
pub fn net_poll(timeout_ms: i32) -> Result<usize> {
    let s = instance()?;
    let mut buf = [PollEvent {
        events: Events::empty(),
        token: 0,
    }; EVENT_BATCH];
    let n = s.poller.wait(&mut buf, timeout_ms)?;
    let mut woken = 0;
    for ev in &buf[..n] {
        if let Some(fiber) = s.claim_waiting(ev) {
            s.global_push_one(fiber);
            woken += 1;
        }
    }
    if woken > 0 {
        log::trace!("net_poll woke {} fibers", woken);
        s.wake_proc();
    }
    Ok(woken)
}

/// A snapshot of scheduler counters, for tests and operational visibility.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct Stats {
    /// Logical processors (fixed at [`init`]).
    pub processors: usize,
    /// OS threads ever bound to the scheduler.
    pub workers: usize,
    /// Workers currently spinning in search of work.
    pub spinning: usize,
    /// Processors currently idle.
    pub idle_processors: usize,
    /// Fibers in the global run queue.
    pub global_queue: usize,
    /// Fibers in the global free pool.
    pub free_fibers: usize,
    /// Total fibers that completed and were recycled.
    pub recycled_fibers: u64,
}

/// Read the scheduler counters. The values are individually coherent but
/// not a consistent cross-section.
pub fn stats() -> Result<Stats> {
    let s = instance()?;
    Ok(Stats {
        processors: s.procs.len(),
        workers: s.workers.load(Ordering::Relaxed),
        spinning: s.spinning.load(Ordering::SeqCst),
        idle_processors: s.idle_proc_count.load(Ordering::SeqCst),
        global_queue: s.global_len.load(Ordering::SeqCst),
        free_fibers: s.free_count.load(Ordering::Relaxed),
        recycled_fibers: s.recycled.load(Ordering::Relaxed),
    })
}
