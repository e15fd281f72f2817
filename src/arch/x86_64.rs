//! SysV x86_64 context switch.
//!
//! Callee-saved integer registers per the SysV ABI: rbx, rbp, r12-r15. The
//! xmm registers are caller-saved and need no spilling here. The asm blocks
//! below hardcode the field offsets of [`Context`]; the layout assertions at
//! the bottom keep them honest.

use core::arch::naked_asm;

/// Saved register set of a suspended context.
///
/// `rsp` points at the resume address: `fiber_switch` is entered by `call`,
/// so the address to continue from is on top of the saved stack, and the
/// `ret` after restoring registers transfers control there.
#[derive(Debug, Default)]
#[repr(C)]
pub(crate) struct Context {
    rsp: usize, // 0x00
    rbp: usize, // 0x08
    rbx: usize, // 0x10
    r12: usize, // 0x18
    r13: usize, // 0x20
    r14: usize, // 0x28
    r15: usize, // 0x30
}

impl Context {
    /// Lay out a freshly-allocated stack so that the first switch into the
    /// context begins executing `entry` with the ABI-mandated alignment: on
    /// function entry `rsp % 16 == 8`, exactly as after a `call`. A null
    /// return-address slot terminates the frame-pointer chain; `entry` never
    /// returns.
    pub(crate) unsafe fn init(ctx: &mut Context, stack_top: *mut u8, entry: extern "C" fn() -> !) {
        let mut sp = stack_top as usize & !15;
        sp -= 8;
        (sp as *mut usize).write(0); // fake return address for `entry`
        sp -= 8;
        (sp as *mut usize).write(entry as usize); // popped by the first `ret`
        *ctx = Context {
            rsp: sp,
            ..Context::default()
        };
    }
}

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn fiber_switch(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // rdi = from, rsi = to. The return address of this call is already
        // on the stack, so saving rsp captures the resume point.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    );
}

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn fiber_jump(_to: *const Context) -> ! {
    naked_asm!(
        // rdi = to. Same restore sequence as fiber_switch, with nothing
        // saved: the abandoned stack is never resumed.
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "ret",
    );
}

const _: () = {
    assert!(std::mem::size_of::<Context>() == 0x38);
    assert!(std::mem::align_of::<Context>() == 8);
};
