//! System call dispatch.
//!
//! Arguments arrive in `r0..r3` with the call number in `r7`; the result
//! (or negative error code) goes back in `r0`. A syscall that went to
//! sleep reports `Restart`: the saved pc is rewound over the SWI
//! instruction so the whole call re-executes after wakeup. Blocking
//! syscalls are written to make that restart idempotent.

use pionabi::syscall::SysCallNumber;
use pionabi::Handle;

use crate::arch::{TsFlags, EI_UNDEFSYSCALL};
use crate::kernel::{KErr, Kernel};

/// Outcome of one dispatch, for the architecture glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Store the value in the caller's `r0`.
    Value(i32),
    /// The caller slept; rewind its pc so the call restarts on wakeup.
    Restart,
}

pub fn dispatch(kernel: &mut Kernel, nr: u32, args: [u32; 4]) -> SyscallOutcome {
    let number = match SysCallNumber::from_u32(nr) {
        Some(n) => n,
        None => {
            // Unknown numbers are an exception, not an error return.
            log::debug!("undefined syscall {:#x}", nr);
            let cur = kernel.cur();
            cur.task_state.flags |= TsFlags::EXCEPTION;
            cur.task_state.exception = EI_UNDEFSYSCALL;
            return SyscallOutcome::Value(pionabi::SysError::Undefined.code());
        },
    };

    use SysCallNumber::*;
    let result = match number {
        exit => kernel.sys_exit(args[0] as i32),
        fork => kernel.sys_fork(args[0]),
        join => kernel.sys_join(args[0] as Handle, args[1]),
        yield_cpu => kernel.sys_yield(),
        set_sched_params => kernel.sys_set_sched_params(args[0] as i32, args[1] as i32),
        close_handle => kernel.sys_close_handle(args[0] as Handle),
        wait_event => kernel.sys_wait_event(args[0] as Handle),
        check_event => kernel.sys_check_event(args[0] as Handle),

        virtualalloc => kernel.sys_virtualalloc(args[0], args[1], args[2]),
        virtualallocphys => kernel.sys_virtualallocphys(args[0], args[1], args[2], args[3]),
        virtualfree => kernel.sys_virtualfree(args[0], args[1]),
        virtualprotect => kernel.sys_virtualprotect(args[0], args[1], args[2]),

        create_channel => kernel.sys_create_channel(args[0]),
        put_msg => kernel.sys_put_msg(args[0] as Handle, args[1], args[2]),
        get_msg => kernel.sys_get_msg(args[0] as Handle, args[1], args[2]),
        put_handle => kernel.sys_put_handle(args[0] as Handle, args[1] as Handle),
        get_handle => kernel.sys_get_handle(args[0] as Handle),
        is_a_channel => kernel.sys_is_a_channel(args[0] as Handle, args[1] as Handle),
        create_notification => kernel.sys_create_notification(args[0]),
        put_notification => kernel.sys_put_notification(args[0] as Handle, args[1] as i32),
        get_notification => kernel.sys_get_notification(args[0] as Handle),

        create_timer => kernel.sys_create_timer(),
        set_timer => kernel.sys_set_timer(args[0] as Handle, args[1], args[2]),
        set_timeout => kernel.sys_set_timeout(args[0]),

        create_interrupt => kernel.sys_create_interrupt(args[0] as usize),
        mask_interrupt => kernel.sys_mask_interrupt(args[0] as usize),
        unmask_interrupt => kernel.sys_unmask_interrupt(args[0] as usize),

        get_system_ports => kernel.sys_get_system_ports(args[0], args[1]),
        get_process_info => kernel.sys_get_process_info(args[0] as Handle, args[1]),
        set_identity => kernel.sys_set_identity(args[0], args[1]),
    };

    match result {
        Ok(value) => SyscallOutcome::Value(value),
        Err(KErr::Sys(e)) => SyscallOutcome::Value(e.code()),
        Err(KErr::Restart) => SyscallOutcome::Restart,
    }
}

/// Entry from the SWI trap: decode the current process's saved
/// registers, dispatch, and write the outcome back.
pub fn dispatch_current(kernel: &mut Kernel) {
    let (nr, args) = {
        let ts = &kernel.cur().task_state;
        (ts.r[7], [ts.r[0], ts.r[1], ts.r[2], ts.r[3]])
    };
    match dispatch(kernel, nr, args) {
        SyscallOutcome::Value(value) => {
            kernel.cur().task_state.r[0] = value as u32;
        },
        SyscallOutcome::Restart => {
            kernel.cur().task_state.rewind_syscall();
        },
    }
}
