//! Process termination: exit flagging, the zombie pipeline, join, and
//! closing of process handles.

use pionabi::{Handle, SysError};

use crate::arch::TsFlags;
use crate::kernel::{KResult, Kernel};
use crate::memory::addrspace::cleanup_address_space;
use crate::memory::uaccess;
use crate::multitasking::handle::{HandleObject, HandleType};
use crate::multitasking::process::{ProcState, ProcessId};

impl Kernel {
    /// `exit` syscall: only records the status and flags the task; the
    /// real teardown happens on the kernel exit path.
    pub fn sys_exit(&mut self, status: i32) -> KResult<i32> {
        let cur = self.cur();
        cur.exit_status = status;
        cur.task_state.flags |= TsFlags::EXIT;
        Ok(0)
    }

    /// The teardown pipeline, run by the kernel exit path. Closes every
    /// handle, frees the address space page by page, drains the deferred
    /// closes those produced, raises the exit event and leaves a zombie
    /// for the parent to reap. The caller reschedules; this process never
    /// returns to user mode.
    pub fn do_exit(&mut self, status: i32) {
        let current = self.current();
        log::debug!("process {} exiting with status {}", current, status);

        {
            let cur = self.cur();
            cur.exit_status = status;
            cur.task_state.flags |= TsFlags::EXIT;
        }

        // Queue every owned handle for closing, then drain. Closing a
        // channel can append freshly inherited handles to the close
        // list, which the drain picks up as well.
        for h in self.handles.owned_by(current) {
            if h == self.procs[&current].handle {
                // The process's own handle stays for join.
                continue;
            }
            let cur = self.cur();
            if !cur.close_handles.contains(&h) {
                cur.close_handles.push_back(h);
            }
        }

        {
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&current).expect("exiting process vanished");
            cleanup_address_space(mem, &mut proc.pmap, &mut proc.aspace);
        }

        self.close_pending_handles();

        if let Some(timer) = self.cur().watchdog.take() {
            self.wheel.discard_timer(timer);
        }

        self.sched_unready(current);
        let own_handle = {
            let cur = self.cur();
            cur.state = ProcState::Zombie;
            cur.handle
        };
        if own_handle >= 0 {
            self.raise_event(own_handle);
        }
        self.reschedule_request = true;
    }

    /// `join` syscall: reap a zombie child named by a process handle,
    /// returning its exit status. Joining a live process or yourself is
    /// an error; callers wait for the exit event first.
    pub fn sys_join(&mut self, h: Handle, status_uva: u32) -> KResult<i32> {
        let current = self.current();
        let child_pid = match self.handles.object_of(current, h, HandleType::Process)? {
            HandleObject::Process(pid) => pid,
            _ => return Err(SysError::Param.into()),
        };
        if child_pid == current {
            return Err(SysError::Param.into());
        }
        if self.procs[&child_pid].state != ProcState::Zombie {
            return Err(SysError::Param.into());
        }

        if status_uva != 0 {
            let status = self.procs[&child_pid].exit_status;
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&current).expect("no current");
            uaccess::copy_out(mem, &mut proc.pmap, status_uva, &status.to_ne_bytes())?;
        }

        self.destroy_process(child_pid);
        self.free_handle(h);
        log::debug!("joined {} via handle {}", child_pid, h);
        Ok(0)
    }

    /// Closing a process handle. A zombie is reaped on the spot. A live
    /// child is orphaned: the handle migrates to the root process, which
    /// reaps it later.
    pub(super) fn do_close_process(&mut self, h: Handle) {
        let current = self.current();
        let child_pid = match self.handles.object_of(current, h, HandleType::Process) {
            Ok(HandleObject::Process(pid)) => pid,
            _ => return,
        };

        if self.procs[&child_pid].state == ProcState::Zombie {
            self.destroy_process(child_pid);
            self.free_handle(h);
            return;
        }

        let root = match self.root {
            Some(root) if root != current => root,
            _ => {
                // Root itself dropping a live child: nobody left to reap
                // it later, so mark the child for termination.
                self.procs.get_mut(&child_pid).expect("no child").task_state.flags |=
                    TsFlags::KILL;
                self.free_handle(h);
                return;
            },
        };

        self.clear_event(current, h);
        let entry = self.handles.get_mut(h).expect("no entry");
        entry.owner = Some(root);
        log::debug!("orphaned {}: handle {} migrated to root", child_pid, h);
    }

    /// Deliver an undefined-instruction exception to the current process.
    pub fn deliver_undef_exception(&mut self) {
        let cur = self.cur();
        cur.task_state.flags |= TsFlags::EXCEPTION;
        cur.task_state.exception = crate::arch::EI_UNDEFINSTR;
    }

    /// Request asynchronous termination of a process (the cancellation
    /// path for blocking syscalls). The next kernel exit of the target
    /// turns this into `exit(EXIT_KILLED)`.
    pub fn kill_process(&mut self, pid: ProcessId) {
        let sleeping = match self.procs.get_mut(&pid) {
            Some(proc) => {
                proc.task_state.flags |= TsFlags::KILL;
                proc.state == ProcState::Sleep
            },
            None => return,
        };
        if sleeping {
            self.wakeup_process(pid);
        }
    }
}
