//! Exception vector table and the save/restore trampolines.
//!
//! Interrupt-model kernel: every entry saves the interrupted user
//! context into a fixed save area, switches to the single kernel stack
//! and calls the matching Rust trap handler. On the way out the save
//! area is refilled from whatever process the scheduler left as current,
//! so a context switch is nothing but a different copy-back.

use core::arch::global_asm;

use crate::arch::TaskState;
use crate::kernel::KERNEL;
use crate::multitasking::{kernel_exit, ExitAction};

global_asm!(
    r#"
    .section .text.vectors
    .align 5
    .global vector_table
vector_table:
    b   reset_entry
    b   undef_entry
    b   swi_entry
    b   prefetch_abort_entry
    b   data_abort_entry
    b   .
    b   irq_entry
    b   .

reset_entry:
    b   .

swi_entry:
    ldr     sp, =user_save_area
    stmia   sp, {{r0 - r12}}^
    bl      save_banked_and_enter_kernel
    bl      arm_swi_trap
    b       return_to_user

irq_entry:
    sub     lr, lr, #4
    ldr     sp, =user_save_area
    stmia   sp, {{r0 - r12}}^
    bl      save_banked_and_enter_kernel
    bl      arm_irq_trap
    b       return_to_user

undef_entry:
    ldr     sp, =user_save_area
    stmia   sp, {{r0 - r12}}^
    bl      save_banked_and_enter_kernel
    bl      arm_undef_trap
    b       return_to_user

prefetch_abort_entry:
    sub     lr, lr, #4
    ldr     sp, =user_save_area
    stmia   sp, {{r0 - r12}}^
    bl      save_banked_and_enter_kernel
    bl      arm_prefetch_abort_trap
    b       return_to_user

data_abort_entry:
    sub     lr, lr, #8
    ldr     sp, =user_save_area
    stmia   sp, {{r0 - r12}}^
    bl      save_banked_and_enter_kernel
    bl      arm_data_abort_trap
    b       return_to_user

save_banked_and_enter_kernel:
    // Saved cpsr and return pc into the save area, user sp/lr via the
    // system-mode banked registers, then onto the kernel stack.
    ldr     sp, =user_save_area
    mrs     r0, spsr
    str     r0, [sp, #0x34]
    str     lr, [sp, #0x40]
    stmdb   sp, {{sp, lr}}^
    ldr     sp, =kernel_stack_top
    bx      lr

return_to_user:
    ldr     sp, =user_save_area
    ldr     r0, [sp, #0x34]
    msr     spsr_cxsf, r0
    ldr     lr, [sp, #0x40]
    ldmia   sp, {{r0 - r12}}^
    ldmdb   sp, {{sp, lr}}^
    movs    pc, lr

    .section .bss
    .align 4
    .global user_save_area
user_save_area:
    .space  0x50
kernel_stack:
    .space  0x2000
kernel_stack_top:
"#
);

extern "C" {
    /// Register file of the interrupted user context, laid out like the
    /// head of `TaskState` (cpsr at 0x34, pc at 0x40 per the asm above).
    static mut user_save_area: TaskState;
}

pub unsafe fn install() {
    // The vector table is linked at the hivecs address; nothing to copy.
    extern "C" {
        static vector_table: u8;
    }
    let _ = &vector_table;
}

/// Restore the current process's context. Used at boot for the very
/// first drop to user mode; later returns go through the trampolines.
pub unsafe fn restore_user_context() -> ! {
    extern "C" {
        fn return_to_user() -> !;
    }
    {
        let kernel = KERNEL.lock();
        user_save_area = kernel.cur_ref().task_state.clone();
    }
    return_to_user()
}

/// Copy the saved user context into the current process, run `body`,
/// then run the kernel exit path and copy the (possibly different)
/// current process's context back out for the trampoline.
fn trap<F: FnOnce(&mut crate::kernel::Kernel)>(body: F) {
    let mut kernel = KERNEL.lock();
    kernel.cur().task_state = unsafe { user_save_area.clone() };

    body(&mut kernel);

    match kernel_exit(&mut kernel) {
        ExitAction::ReturnToUser => unsafe {
            user_save_area = kernel.cur_ref().task_state.clone();
        },
        ExitAction::Idle => {
            drop(kernel);
            // The idle task: preemptible, stateless, restarted from the
            // top by the next kernel entry.
            loop {
                unsafe {
                    crate::hal::enable_interrupts();
                    crate::hal::wait_for_interrupt();
                    crate::hal::disable_interrupts();
                }
            }
        },
    }
}

#[no_mangle]
extern "C" fn arm_swi_trap() {
    trap(|kernel| crate::syscall::dispatch_current(kernel));
}

#[no_mangle]
extern "C" fn arm_irq_trap() {
    crate::interrupt::top_half();
    trap(|_| {});
}

#[no_mangle]
extern "C" fn arm_undef_trap() {
    trap(|kernel| kernel.deliver_undef_exception());
}

#[no_mangle]
extern "C" fn arm_prefetch_abort_trap() {
    let (addr, access) = unsafe { read_fault_status(true) };
    trap(|kernel| crate::memory::handle_fault(kernel, addr, access));
}

#[no_mangle]
extern "C" fn arm_data_abort_trap() {
    let (addr, access) = unsafe { read_fault_status(false) };
    trap(|kernel| crate::memory::handle_fault(kernel, addr, access));
}

/// Read FAR/DFSR and classify the access. A fault taken in a non-user
/// mode means kernel code touched a bad address: unrecoverable.
unsafe fn read_fault_status(prefetch: bool) -> (u32, u32) {
    use pionabi::vm::MapFlags;

    let mut spsr: u32;
    core::arch::asm!("mrs {t}, spsr", t = out(reg) spsr, options(nostack));
    if spsr & 0xf != 0 {
        panic!("fault in kernel mode, spsr {:#x}", spsr);
    }

    if prefetch {
        let mut ifar: u32;
        core::arch::asm!("mrc p15, 0, {t}, c6, c0, 2", t = out(reg) ifar, options(nostack));
        return (ifar, MapFlags::PROT_EXEC.bits());
    }
    let mut far: u32;
    let mut dfsr: u32;
    core::arch::asm!("mrc p15, 0, {t}, c6, c0, 0", t = out(reg) far, options(nostack));
    core::arch::asm!("mrc p15, 0, {t}, c5, c0, 0", t = out(reg) dfsr, options(nostack));
    let access = if dfsr & (1 << 11) != 0 {
        MapFlags::PROT_WRITE.bits()
    } else {
        MapFlags::PROT_READ.bits()
    };
    (far, access)
}
