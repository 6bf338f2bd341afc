//! The single return path from kernel to user mode.
//!
//! Every syscall, interrupt and exception funnels through here before the
//! saved user context is restored: deferred bottom halves run, a
//! requested reschedule happens (re-entering the path for the incoming
//! process), fatal task-state flags turn into `do_exit`, the deferred
//! handle closes drain, and kernel continuations get the CPU last.

use pionabi::process::{EXIT_FATAL, EXIT_KILLED};
use pionabi::Handle;

use crate::arch::TsFlags;
use crate::kernel::Kernel;
use crate::multitasking::handle::HandleType;
use crate::multitasking::process::KernelTask;

/// What the architecture layer should do after the deferred work ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Restore the current process's context and drop to user mode.
    ReturnToUser,
    /// The idle task has the CPU: release the kernel and wait for
    /// interrupts. Restarted from scratch on the next kernel entry.
    Idle,
}

pub fn kernel_exit(kernel: &mut Kernel) -> ExitAction {
    loop {
        kernel.timer_bottom_half();
        kernel.interrupt_bottom_half();

        if kernel.reschedule_request {
            kernel.reschedule_request = false;
            let previous = kernel.current();
            kernel.reschedule();
            if kernel.current() != previous {
                // A different process is coming up: run its deferred
                // work before returning to it.
                continue;
            }
        }

        let flags = kernel.cur().task_state.flags;
        if flags.contains(TsFlags::EXIT) {
            let status = kernel.cur().exit_status;
            kernel.do_exit(status);
            continue;
        }
        if flags.contains(TsFlags::KILL) {
            kernel.do_exit(EXIT_KILLED);
            continue;
        }
        if flags.contains(TsFlags::EXCEPTION) {
            kernel.do_exit(EXIT_FATAL);
            continue;
        }

        kernel.close_pending_handles();

        return match kernel.cur().continuation {
            Some(KernelTask::Idle) => ExitAction::Idle,
            None => ExitAction::ReturnToUser,
        };
    }
}

impl Kernel {
    /// Drain the current process's deferred-close list, dispatching on
    /// object type. Closing a channel can push inherited handles onto
    /// the same list; they are picked up in the same drain.
    pub fn close_pending_handles(&mut self) {
        loop {
            let h: Handle = match self.cur().close_handles.pop_front() {
                Some(h) => h,
                None => break,
            };
            let current = self.current();
            let htype = match self.handles.get(h) {
                Some(entry) if entry.owner == Some(current) => entry.htype,
                _ => continue,
            };
            match htype {
                HandleType::Process => self.do_close_process(h),
                HandleType::Isr => self.do_close_isr(h),
                HandleType::Channel => self.do_close_channel(h),
                HandleType::Timer => self.do_close_timer(h),
                HandleType::Notification => self.do_close_notification(h),
                HandleType::Free => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitasking::handle::HandleObject;
    use crate::multitasking::process::ProcState;
    use pionabi::process::EXIT_SUCCESS;

    #[test]
    fn exit_flag_is_converted_on_the_way_out() {
        let mut k = Kernel::for_tests();
        let root = k.current();
        k.sys_exit(EXIT_SUCCESS).unwrap();

        let action = kernel_exit(&mut k);
        assert_eq!(k.procs[&root].state, ProcState::Zombie);
        assert_ne!(k.current(), root);
        // Nothing else runnable: the idle task takes over.
        assert_eq!(k.current(), k.sched.idle);
        assert_eq!(action, ExitAction::Idle);
    }

    #[test]
    fn kill_flag_exits_with_killed_status() {
        let mut k = Kernel::for_tests();
        let root = k.current();
        k.kill_process(root);
        kernel_exit(&mut k);
        assert_eq!(k.procs[&root].state, ProcState::Zombie);
        assert_eq!(k.procs[&root].exit_status, EXIT_KILLED);
    }

    #[test]
    fn pending_closes_drain_on_exit_path() {
        let mut k = Kernel::for_tests();
        let free_before = k.handles.free_count();

        let mut pair = [0 as Handle; 2];
        k.create_channel_pair(&mut pair).unwrap();
        k.sys_close_handle(pair[0]).unwrap();
        k.sys_close_handle(pair[1]).unwrap();

        let action = kernel_exit(&mut k);
        assert_eq!(action, ExitAction::ReturnToUser);
        assert_eq!(k.handles.free_count(), free_before);
        assert!(k.cur().close_handles.is_empty());
    }

    #[test]
    fn reschedule_request_switches_before_return() {
        let mut k = Kernel::for_tests();
        let rt = k.alloc_process(pionabi::process::SCHED_RR, 9).unwrap();
        {
            let proc = k.procs.get_mut(&rt).unwrap();
            proc.state = ProcState::Ready;
        }
        k.sched_ready(rt);

        assert!(k.reschedule_request);
        kernel_exit(&mut k);
        assert_eq!(k.current(), rt);
    }

    #[test]
    fn exit_reaps_every_channel_handle() {
        // A process opens 16 channels then exits; after join the free
        // handle count is back where it started.
        let mut k = Kernel::for_tests();
        let free_before = k.handles.free_count();

        let h = k.sys_fork(0).unwrap();
        let child = match k.handles.get(h).unwrap().object {
            HandleObject::Process(pid) => pid,
            _ => unreachable!(),
        };

        let parent = k.current();
        k.sched.current = child;
        k.procs.get_mut(&child).unwrap().state = ProcState::Running;
        for _ in 0..16 {
            let mut pair = [0 as Handle; 2];
            k.create_channel_pair(&mut pair).unwrap();
        }
        k.sys_exit(EXIT_SUCCESS).unwrap();
        kernel_exit(&mut k);
        assert_eq!(k.procs[&child].state, ProcState::Zombie);

        k.sched.current = parent;
        k.procs.get_mut(&parent).unwrap().state = ProcState::Running;
        k.sys_join(h, 0).unwrap();
        assert_eq!(k.handles.free_count(), free_before);
    }
}
