//! Architecture-specific context switching.
//!
//! A [`Context`] is the saved register set of a suspended fiber: stack
//! pointer, frame pointer and the platform's callee-saved registers. The
//! instruction pointer travels on the stack itself: [`switch`] is entered
//! through a regular `call`, so the resume address is already spilled, and
//! the trailing `ret` of the assembly performs the jump into the target
//! context.
//!
//! The platform's stock user-context primitive is deliberately not used: it
//! performs a signal-mask syscall on every switch, and all fibers here share
//! one signal mask by construction.
//!
//! Safety protocol: `switch(from, to)` and `jump(to)` may only be called
//! with `to` pointing at a context previously filled either by a `switch`
//! that saved into it, or by [`Context::init`] over a freshly prepared
//! stack. A context must never be entered by two threads at once.

#[cfg(target_arch = "x86_64")]
#[path = "arch/x86_64.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "arch/aarch64.rs"]
mod imp;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported target architecture: a context-switch primitive is required");

pub(crate) use imp::Context;

/// Save the current execution state into `from` and resume `to`.
///
/// Returns when some other context switches (or jumps) back into `from`.
#[inline(always)]
pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
    imp::fiber_switch(from, to)
}

/// Resume `to` without saving the current state. The current stack is
/// abandoned; there is no way back into this call.
#[inline(always)]
pub(crate) unsafe fn jump(to: *const Context) -> ! {
    imp::fiber_jump(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::FiberStack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // A raw round-trip through the switch primitive on a single thread: main
    // context -> fresh stack -> back. No scheduler involved.
    static MAIN_CTX: AtomicUsize = AtomicUsize::new(0);
    static HOPS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn entry() -> ! {
        HOPS.fetch_add(1, Ordering::SeqCst);
        let main = MAIN_CTX.load(Ordering::SeqCst) as *const Context;
        unsafe { jump(main) }
    }

    #[test]
    fn switch_round_trip() {
        let stack = FiberStack::new(32 * 1024).unwrap();
        let mut main = Context::default();
        let mut fresh = Context::default();
        unsafe {
            Context::init(&mut fresh, stack.top(), entry);
        }
        MAIN_CTX.store(&main as *const Context as usize, Ordering::SeqCst);
        unsafe {
            switch(&mut main, &fresh);
        }
        assert_eq!(HOPS.load(Ordering::SeqCst), 1);
    }
}
