//! ARM-specific process state and the kernel entry/exit glue.
//!
//! The kernel is an interrupt-model design: a single kernel stack, and
//! every entry (SWI, IRQ, abort) saves the interrupted user context into
//! the current process's `TaskState` before running kernel code.

#[cfg(all(target_arch = "arm", not(test)))]
mod vectors;

bitflags! {
    /// Deferred-condition flags checked on the kernel exit path.
    pub struct TsFlags: u32 {
        /// `exit()` was called; terminate before returning to user mode.
        const EXIT = 1 << 0;
        /// Another process closed us or asked for termination.
        const KILL = 1 << 1;
        /// A page fault is being serviced.
        const PAGEFAULT = 1 << 2;
        /// An unrecoverable fault occurred; exits with `EXIT_FATAL`.
        const EXCEPTION = 1 << 3;
    }
}

/// Exception kinds recorded in `TaskState::exception`.
pub const EI_PAGEFAULT: u32 = 0;
pub const EI_UNDEFSYSCALL: u32 = 1;
pub const EI_UNDEFINSTR: u32 = 2;

/// CPSR with user mode, ARM state, IRQs enabled.
pub const CPSR_USER_DEFAULT: u32 = 0x0000_0010;

/// Width of the SWI instruction; subtracted from the saved pc to restart
/// a system call.
pub const SYSCALL_INSN_SIZE: u32 = 4;

/// Saved user-mode CPU context plus the deferred-condition bookkeeping
/// that the exception handlers and the kernel exit path share.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct TaskState {
    pub cpsr: u32,
    /// r0..r12. r0 holds syscall results, r0..r3 the arguments and r7 the
    /// syscall number.
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,

    pub flags: TsFlags,
    pub exception: u32,
    pub fault_addr: u32,
    pub fault_access: u32,
}

impl TaskState {
    /// Fresh user-mode context starting at `entry` with stack `stack_top`.
    pub fn new_user(entry: u32, stack_top: u32) -> Self {
        TaskState {
            cpsr: CPSR_USER_DEFAULT,
            r: [0; 13],
            sp: stack_top,
            lr: 0,
            pc: entry,
            flags: TsFlags::empty(),
            exception: 0,
            fault_addr: 0,
            fault_access: 0,
        }
    }

    /// The child's context after fork: identical to the parent except that
    /// the syscall returns 0 in the child.
    pub fn forked_from(parent: &TaskState) -> Self {
        let mut ts = parent.clone();
        ts.r[0] = 0;
        ts.flags = TsFlags::empty();
        ts
    }

    /// Rewind the saved pc so the SWI instruction re-executes; used to
    /// restart a blocking system call after wakeup.
    pub fn rewind_syscall(&mut self) {
        self.pc = self.pc.wrapping_sub(SYSCALL_INSN_SIZE);
    }
}

/// Load the first process's context and drop to user mode. Never returns.
pub unsafe fn enter_first_process() -> ! {
    #[cfg(all(target_arch = "arm", not(test)))]
    {
        vectors::install();
        vectors::restore_user_context()
    }
    #[cfg(not(all(target_arch = "arm", not(test))))]
    unreachable!("user mode exists only on the target")
}

/// Activate a process's translation table.
pub unsafe fn switch_address_space(l1_phys: usize) {
    #[cfg(target_arch = "arm")]
    {
        // Set TTBR0 and nuke stale translations; ASIDs are not used.
        core::arch::asm!(
            "mcr p15, 0, {t}, c2, c0, 0",
            t = in(reg) l1_phys as u32,
            options(nostack)
        );
        flush_tlb();
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = l1_phys;
}

/// Invalidate the entire TLB. Called after any batch of mapping changes.
pub fn flush_tlb() {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("mcr p15, 0, {t}, c8, c7, 0", t = in(reg) 0u32, options(nostack));
    }
}
