//! Machine-level context switch between fiber stacks.
//!
//! A context is nothing more than a saved stack pointer: the switch routine
//! pushes the callee-saved register file onto the current stack, stores the
//! stack pointer, loads the target's stack pointer and pops its register
//! file. The first resume of a fresh fiber "returns" into an entry thunk
//! that forwards a pointer argument (seeded into a callee-saved register at
//! stack initialization) to a Rust entry function that never returns.
//!
//! Only the registers the System V x86-64 and AAPCS64 ABIs require a callee
//! to preserve are saved; the caller-saved half of the register file is dead
//! across the call by definition.

use std::ffi::c_void;

/// Saved execution state of a suspended fiber (or of the outer thread).
#[derive(Debug)]
#[repr(C)]
pub struct FiberContext {
    stack_pointer: *mut c_void,
}

// The context only crosses fibers, never threads.
impl FiberContext {
    /// A context that has never been switched out of.
    pub fn empty() -> Self {
        Self {
            stack_pointer: std::ptr::null_mut(),
        }
    }
}

extern "C" {
    /// Save the current register file and stack pointer into `save`, then
    /// resume execution from `load`.
    ///
    /// # Safety
    /// `load` must hold a stack pointer produced by this function or by
    /// [`FiberContext::init`], on a stack that is still mapped. The caller
    /// must not hold references it expects to stay unique across the switch.
    pub fn weft_switch_context(save: *mut FiberContext, load: *const FiberContext);

    fn weft_fiber_entry();
}

/// Number of u64 slots the initial frame occupies on x86_64.
#[cfg(target_arch = "x86_64")]
const INIT_FRAME_WORDS: usize = 7;

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl weft_switch_context",
    ".type weft_switch_context, @function",
    "weft_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size weft_switch_context, . - weft_switch_context",
    // First activation of a fiber: r12 carries the argument, r13 the Rust
    // entry function. The stack is 16-aligned here, so `call` establishes
    // the alignment the ABI promises at function entry.
    ".p2align 4",
    ".globl weft_fiber_entry",
    ".type weft_fiber_entry, @function",
    "weft_fiber_entry:",
    "xor ebp, ebp",
    "mov rdi, r12",
    "call r13",
    "ud2",
    ".size weft_fiber_entry, . - weft_fiber_entry",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl weft_switch_context",
    ".type weft_switch_context, %function",
    "weft_switch_context:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8,  d9,  [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x2, sp",
    "str x2, [x0]",
    "ldr x2, [x1]",
    "mov sp, x2",
    "ldp x19, x20, [sp]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8,  d9,  [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    ".size weft_switch_context, . - weft_switch_context",
    // First activation: x19 carries the argument, x20 the Rust entry.
    ".p2align 2",
    ".globl weft_fiber_entry",
    ".type weft_fiber_entry, %function",
    "weft_fiber_entry:",
    "mov x29, xzr",
    "mov x0, x19",
    "blr x20",
    "brk #1",
    ".size weft_fiber_entry, . - weft_fiber_entry",
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is implemented for x86_64 and aarch64 only");

impl FiberContext {
    /// Build the initial context of a fresh fiber on `stack_top` (one past
    /// the highest usable byte, 16-aligned). The first switch into the
    /// returned context calls `entry(argument)` on that stack.
    ///
    /// # Safety
    /// `stack_top` must point at the top of a live, sufficiently large
    /// mapping, and `argument` must stay valid until `entry` runs.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn init(stack_top: *mut c_void, entry: extern "C" fn(*mut c_void) -> !, argument: *mut c_void) -> Self {
        debug_assert_eq!(stack_top as usize % 16, 0);
        let frame = (stack_top as *mut u64).sub(INIT_FRAME_WORDS);
        // Popped as r15, r14, r13, r12, rbx, rbp, then `ret`.
        frame.add(0).write(0); // r15
        frame.add(1).write(0); // r14
        frame.add(2).write(entry as usize as u64); // r13
        frame.add(3).write(argument as u64); // r12
        frame.add(4).write(0); // rbx
        frame.add(5).write(0); // rbp
        frame.add(6).write(weft_fiber_entry as usize as u64);
        Self {
            stack_pointer: frame as *mut c_void,
        }
    }

    /// See the x86_64 variant. The 160-byte frame mirrors the store order
    /// of `weft_switch_context`; `x30` is pointed at the entry thunk.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn init(stack_top: *mut c_void, entry: extern "C" fn(*mut c_void) -> !, argument: *mut c_void) -> Self {
        debug_assert_eq!(stack_top as usize % 16, 0);
        let frame = (stack_top as *mut u64).sub(20);
        for slot in 0..20 {
            frame.add(slot).write(0);
        }
        frame.add(0).write(argument as u64); // x19
        frame.add(1).write(entry as usize as u64); // x20
        frame.add(11).write(weft_fiber_entry as usize as u64); // x30
        Self {
            stack_pointer: frame as *mut c_void,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::stack::FiberStack;
    use std::cell::Cell;

    thread_local! {
        static TRACE: Cell<u32> = const { Cell::new(0) };
        static MAIN: Cell<*mut FiberContext> = const { Cell::new(std::ptr::null_mut()) };
    }

    extern "C" fn bounce(arg: *mut std::ffi::c_void) -> ! {
        let own = arg as *mut FiberContext;
        TRACE.with(|t| t.set(t.get() + 1));
        unsafe {
            weft_switch_context(own, MAIN.with(|m| m.get()));
        }
        TRACE.with(|t| t.set(t.get() + 100));
        unsafe {
            weft_switch_context(own, MAIN.with(|m| m.get()));
        }
        unreachable!("fiber resumed after final switch out");
    }

    #[test]
    fn test_switch_runs_entry_and_resumes() {
        let stack = FiberStack::allocate(64 * 1024).expect("stack");
        let mut main = FiberContext::empty();
        let main_ptr = &mut main as *mut FiberContext;
        MAIN.with(|m| m.set(main_ptr));

        // The fiber saves its own context into the same slot we seed it from.
        let mut fiber = Box::new(FiberContext::empty());
        let fiber_ptr: *mut FiberContext = &mut *fiber;
        *fiber = unsafe { FiberContext::init(stack.top(), bounce, fiber_ptr as *mut _) };

        unsafe { weft_switch_context(main_ptr, fiber_ptr) };
        assert_eq!(TRACE.with(|t| t.get()), 1);

        unsafe { weft_switch_context(main_ptr, fiber_ptr) };
        assert_eq!(TRACE.with(|t| t.get()), 101);
    }
}
