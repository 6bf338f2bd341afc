//! Per-handle events and the handle-wait syscalls.
//!
//! Every handle carries one pending bit. Raising an event sets the bit
//! and queues the handle on its owner's pending list; consuming it (wait
//! or check) clears both. Repeated raises before a wait collapse into a
//! single wake.

use pionabi::{Handle, SysError, HANDLE_ANY};

use crate::arch::TsFlags;
use crate::kernel::{KResult, Kernel};
use crate::multitasking::handle::HandleType;
use crate::multitasking::process::ProcessId;

impl Kernel {
    /// Raise an event on `h`: set the pending bit and wake the owner if
    /// it is waiting for this handle (or for any).
    pub fn raise_event(&mut self, h: Handle) {
        let owner = match self.handles.get(h) {
            Some(entry) => match entry.owner {
                Some(owner) => owner,
                None => return, // in-flight handle, nobody to notify
            },
            None => {
                log::warn!("raise_event on bad handle {}", h);
                return;
            },
        };

        let entry = self.handles.get_mut(h).expect("entry vanished");
        if !entry.pending {
            entry.pending = true;
            let proc = self.procs.get_mut(&owner).expect("owner vanished");
            debug_assert!(!proc.pending_handles.contains(&h));
            proc.pending_handles.push_back(h);
        }

        let proc = &self.procs[&owner];
        if proc.sleeping_on == Some(proc.waitfor_rendez)
            && (proc.waiting_for == h || proc.waiting_for == HANDLE_ANY)
        {
            let r = proc.waitfor_rendez;
            self.wakeup(r);
        }
    }

    /// Clear a pending event, used when handles are closed.
    pub fn clear_event(&mut self, owner: ProcessId, h: Handle) {
        let entry = match self.handles.get_mut(h) {
            Some(e) => e,
            None => return,
        };
        if entry.htype == HandleType::Free || entry.owner != Some(owner) {
            return;
        }
        if entry.pending {
            entry.pending = false;
            if let Some(proc) = self.procs.get_mut(&owner) {
                proc.pending_handles.retain(|p| *p != h);
            }
        }
    }

    /// `wait_event` syscall. Blocks until `h` (or any owned handle for
    /// `HANDLE_ANY`) has a pending event, consumes it, and returns the
    /// handle number.
    pub fn sys_wait_event(&mut self, h: Handle) -> KResult<i32> {
        let current = self.current();
        if h < HANDLE_ANY || (h >= 0 && h as usize >= self.handles.max_handle()) {
            return Err(SysError::Param.into());
        }

        // A kill is already pending: let the exit path run instead of
        // going to sleep forever.
        if self.cur().task_state.flags.contains(TsFlags::KILL) {
            return Err(SysError::Undefined.into());
        }

        if h == HANDLE_ANY {
            let first = self.cur().pending_handles.front().copied();
            match first {
                Some(pending) => {
                    self.consume_event(current, pending);
                    Ok(pending)
                },
                None => {
                    let cur = self.cur();
                    cur.waiting_for = HANDLE_ANY;
                    let r = cur.waitfor_rendez;
                    Err(self.sleep(r))
                },
            }
        } else {
            let entry = self.handles.get(h).ok_or(SysError::Param)?;
            if entry.owner != Some(current) {
                return Err(SysError::Handle.into());
            }
            if entry.pending {
                self.consume_event(current, h);
                Ok(h)
            } else {
                let cur = self.cur();
                cur.waiting_for = h;
                let r = cur.waitfor_rendez;
                Err(self.sleep(r))
            }
        }
    }

    /// `check_event` syscall: non-blocking variant; an absent event is an
    /// error, not a wait.
    pub fn sys_check_event(&mut self, h: Handle) -> KResult<i32> {
        let current = self.current();
        let entry = self.handles.get(h).ok_or(SysError::Param)?;
        if entry.htype != HandleType::Free && entry.owner == Some(current) && entry.pending {
            self.consume_event(current, h);
            Ok(h)
        } else {
            Err(SysError::Param.into())
        }
    }

    fn consume_event(&mut self, owner: ProcessId, h: Handle) {
        let entry = self.handles.get_mut(h).expect("consume: bad handle");
        debug_assert!(entry.pending);
        entry.pending = false;
        let proc = self.procs.get_mut(&owner).expect("consume: no owner");
        proc.pending_handles.retain(|p| *p != h);
    }
}
