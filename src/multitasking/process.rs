//! Process descriptors and creation (fork).

use alloc::collections::VecDeque;
use core::fmt;
use core::num::NonZeroU64;

use pionabi::process::{self, ProcFlags, SCHED_OTHER, STRIDE1};
use pionabi::{Handle, SysError, NSYSPORT};

use crate::arch::TaskState;
use crate::ipc::msgport::MsgId;
use crate::kernel::{KResult, Kernel};
use crate::memory::addrspace::{fork_address_space, AddressSpace};
use crate::memory::pmap::Pmap;
use crate::multitasking::handle::{HandleObject, HandleType};
use crate::multitasking::rendez::RendezId;
use crate::time::TimerId;

/// Kernel-internal process name. Userspace never sees these; it refers to
/// processes through handles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(NonZeroU64);

impl ProcessId {
    pub const fn first() -> Self {
        Self(unsafe { NonZeroU64::new_unchecked(1) })
    }

    pub fn next(self) -> Self {
        Self(NonZeroU64::new(self.0.get() + 1).expect("ProcessId overflow"))
    }

    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Init,
    Ready,
    Running,
    Sleep,
    Zombie,
}

impl ProcState {
    pub fn as_abi(self) -> u32 {
        match self {
            ProcState::Init => process::state::INIT,
            ProcState::Ready => process::state::READY,
            ProcState::Running => process::state::RUNNING,
            ProcState::Sleep => process::state::SLEEP,
            ProcState::Zombie => process::state::ZOMBIE,
        }
    }
}

/// Kernel tasks run as continuations on the kernel exit path. They keep
/// no state: preemption restarts them from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelTask {
    /// The per-CPU idle loop.
    Idle,
}

/// Scheduling policy used only by the idle process.
pub const SCHED_IDLE: i32 = -1;

#[derive(Debug)]
pub struct Process {
    pub pid: ProcessId,
    /// Saved CPU context plus deferred-condition flags.
    pub task_state: TaskState,
    /// The handle naming this process (owned by the parent; by the
    /// process itself for the root).
    pub handle: Handle,
    pub state: ProcState,

    // Scheduling
    pub sched_policy: i32,
    /// Stride tickets, or the real-time priority for RR/FIFO.
    pub tickets: i32,
    pub stride: i64,
    pub remaining: i64,
    pub pass: i64,
    pub quanta_used: u32,

    pub flags: ProcFlags,

    // Identity
    pub uid: u32,
    pub gid: u32,
    pub pgrp: u32,

    // Memory
    pub pmap: Pmap,
    pub aspace: AddressSpace,

    pub exit_status: i32,

    // Rendez bookkeeping
    pub sleeping_on: Option<RendezId>,
    pub waitfor_rendez: RendezId,
    /// Handle being waited on while sleeping on `waitfor_rendez`;
    /// `HANDLE_ANY` for any.
    pub waiting_for: Handle,

    pub pending_handles: VecDeque<Handle>,
    pub close_handles: VecDeque<Handle>,

    // Timeout support for blocking syscalls
    pub watchdog: Option<TimerId>,
    pub timeout_expired: bool,

    pub continuation: Option<KernelTask>,

    pub system_ports: [Handle; NSYSPORT],

    /// In-flight message-port send, so the restarted syscall finds its
    /// message again.
    pub pending_msg: Option<MsgId>,
}

impl Process {
    pub fn new(pid: ProcessId, waitfor_rendez: RendezId, policy: i32, tickets: i32) -> Self {
        let stride = if policy == SCHED_OTHER && tickets > 0 {
            STRIDE1 / tickets as i64
        } else {
            0
        };
        Process {
            pid,
            task_state: TaskState::new_user(0, 0),
            handle: -1,
            state: ProcState::Init,
            sched_policy: policy,
            tickets,
            stride,
            remaining: 0,
            pass: 0,
            quanta_used: 0,
            flags: ProcFlags::empty(),
            uid: 0,
            gid: 0,
            pgrp: 0,
            pmap: Pmap::new(),
            aspace: AddressSpace::new(),
            exit_status: 0,
            sleeping_on: None,
            waitfor_rendez,
            waiting_for: pionabi::HANDLE_ANY,
            pending_handles: VecDeque::new(),
            close_handles: VecDeque::new(),
            watchdog: None,
            timeout_expired: false,
            continuation: None,
            system_ports: [-1; NSYSPORT],
            pending_msg: None,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.flags.contains(ProcFlags::ALLOW_IO)
    }
}

impl Kernel {
    /// Copy-on-write fork of the current process. Returns the child's
    /// handle in the parent; the child wakes up with a return value of 0.
    pub fn sys_fork(&mut self, _flags: u32) -> KResult<i32> {
        if self.handles.free_count() < 1 {
            return Err(SysError::Resource.into());
        }
        let h = self.handles.alloc().ok_or(SysError::Resource)?;

        let parent_pid = self.current();
        let (parent_policy, parent_tickets) = {
            let parent = &self.procs[&parent_pid];
            (parent.sched_policy, parent.tickets)
        };
        let child_pid = match self.alloc_process(parent_policy, parent_tickets) {
            Ok(pid) => pid,
            Err(e) => {
                self.free_handle(h);
                return Err(e.into());
            },
        };

        // Child context: parent's registers with a zero return value.
        {
            let parent = &self.procs[&parent_pid];
            let ts = TaskState::forked_from(&parent.task_state);
            let flags = parent.flags;
            let (uid, gid, pgrp) = (parent.uid, parent.gid, parent.pgrp);
            let ports = parent.system_ports;
            let child = self.procs.get_mut(&child_pid).expect("child vanished");
            child.task_state = ts;
            child.handle = h;
            child.flags = flags;
            child.uid = uid;
            child.gid = gid;
            child.pgrp = pgrp;
            child.system_ports = ports;
        }

        // Duplicate the address space copy-on-write.
        let fork_result = {
            let mut child = self.procs.remove(&child_pid).expect("child vanished");
            let result = {
                let Kernel { mem, procs, .. } = self;
                let parent = procs.get_mut(&parent_pid).expect("parent vanished");
                fork_address_space(
                    mem,
                    &mut child.pmap,
                    &mut child.aspace,
                    &mut parent.pmap,
                    &parent.aspace,
                )
            };
            self.procs.insert(child_pid, child);
            result
        };
        if let Err(e) = fork_result {
            self.destroy_process(child_pid);
            self.free_handle(h);
            return Err(e.into());
        }

        self.handles
            .set_object(parent_pid, h, HandleType::Process, HandleObject::Process(child_pid));

        let child = self.procs.get_mut(&child_pid).expect("child vanished");
        child.state = ProcState::Ready;
        self.sched_ready(child_pid);

        log::debug!("fork: {} -> {} (handle {})", parent_pid, child_pid, h);
        Ok(h)
    }

    /// Allocate a process table entry with its waitfor rendez. The caller
    /// fills in context and memory before making it ready.
    pub fn alloc_process(&mut self, policy: i32, tickets: i32) -> Result<ProcessId, SysError> {
        if self.procs.len() >= self.limits.max_process {
            return Err(SysError::Resource);
        }
        let rendez = self.alloc_rendez()?;
        let pid = self.next_pid;
        self.next_pid = pid.next();
        let mut proc = Process::new(pid, rendez, policy, tickets);
        proc.pass = self.sched.global_pass;
        self.procs.insert(pid, proc);
        Ok(pid)
    }

    /// Drop a process entry and the resources only the table owns. The
    /// address space must already be empty.
    pub fn destroy_process(&mut self, pid: ProcessId) {
        if let Some(mut proc) = self.procs.remove(&pid) {
            proc.pmap.destroy(&mut self.mem);
            self.free_rendez(proc.waitfor_rendez);
            if let Some(timer) = proc.watchdog.take() {
                self.wheel.discard_timer(timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::memory::{PageFlags, PAGE_SIZE};

    #[test]
    fn fork_returns_child_handle_and_child_sees_zero() {
        let mut k = Kernel::for_tests();
        let parent = k.current();
        let h = k.sys_fork(0).unwrap();
        assert!(h >= 0);

        let child_pid = match k.handles.get(h).unwrap().object {
            HandleObject::Process(pid) => pid,
            ref other => panic!("wrong object {:?}", other),
        };
        assert_ne!(child_pid, parent);
        let child = &k.procs[&child_pid];
        assert_eq!(child.task_state.r[0], 0);
        assert_eq!(child.state, ProcState::Ready);
        assert_eq!(child.handle, h);
    }

    #[test]
    fn fork_cow_smoke() {
        // Parent writes 0xa5, forks, writes 0x5a; child still sees 0xa5.
        let mut k = Kernel::for_tests();
        let va = 0x0100_0000;
        let mapped = k.sys_virtualalloc(
            va,
            PAGE_SIZE as u32,
            (PageFlags::PROT_READ | PageFlags::PROT_WRITE).bits(),
        )
        .unwrap();
        assert_eq!(mapped as usize, PAGE_SIZE);
        k.poke_user(va, 0xa5);
        assert_eq!(k.peek_user(va), 0xa5);

        let h = k.sys_fork(0).unwrap();
        let child_pid = match k.handles.get(h).unwrap().object {
            HandleObject::Process(pid) => pid,
            _ => unreachable!(),
        };

        assert_eq!(k.peek_user_of(child_pid, va), 0xa5);
        k.poke_user(va, 0x5a);
        assert_eq!(k.peek_user(va), 0x5a);
        assert_eq!(k.peek_user_of(child_pid, va), 0xa5);

        // After the write the writer's page has a single reference.
        let parent_pid = k.current();
        let (pa, flags) = {
            let Kernel { mem, procs, .. } = &mut k;
            procs[&parent_pid].pmap.extract(mem, va).unwrap()
        };
        assert!(!flags.cow());
        let idx = k.mem.frame_index(pa).unwrap();
        assert_eq!(k.mem.frame(idx).reference_cnt, 1);
    }

    #[test]
    fn fork_exhausts_process_table() {
        let mut k = Kernel::for_tests();
        let max = k.limits.max_process;
        let mut made = 0;
        loop {
            match k.sys_fork(0) {
                Ok(_) => made += 1,
                Err(crate::kernel::KErr::Sys(SysError::Resource)) => break,
                Err(e) => panic!("unexpected {:?}", e),
            }
            assert!(made < max, "never hit the table limit");
        }
        // A failed fork must not leak its handle.
        let free_before = k.handles.free_count();
        assert!(matches!(
            k.sys_fork(0),
            Err(crate::kernel::KErr::Sys(SysError::Resource))
        ));
        assert_eq!(k.handles.free_count(), free_before);
    }
}
