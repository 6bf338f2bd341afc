//! Process-related ABI: scheduling policies, exit statuses, spawn flags
//! and the record returned by `get_process_info`.

/// Proportional-share scheduling (the default).
pub const SCHED_OTHER: i32 = 0;
/// Real-time round-robin, 32 priorities. Requires the allow-io privilege.
pub const SCHED_RR: i32 = 1;
/// Real-time run-to-block. Requires the allow-io privilege.
pub const SCHED_FIFO: i32 = 2;

/// Stride scheduler constants. A `SCHED_OTHER` process holds
/// `1..=STRIDE_MAX_TICKETS` tickets; its stride is `STRIDE1 / tickets`.
pub const STRIDE1: i64 = 1_000_000;
pub const STRIDE_DEFAULT_TICKETS: i32 = 100;
pub const STRIDE_MAX_TICKETS: i32 = 800;

/// Timer ticks a RR or OTHER process may run before the scheduler rotates it.
pub const PROCESS_QUANTA: u32 = 2;

/// Exit statuses with fixed meaning. Anything else is application-defined.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// The process hit an unrecoverable fault (bad memory access, undefined
/// instruction) and was terminated by the kernel.
pub const EXIT_FATAL: i32 = 2;
/// The process was killed by a close of its handle or an explicit kill.
pub const EXIT_KILLED: i32 = 3;

bitflags! {
    /// Per-process privilege/behavior bits, set at spawn and inherited
    /// over fork.
    pub struct ProcFlags: u32 {
        /// May map physical memory, own interrupts and use real-time
        /// scheduling policies.
        const ALLOW_IO = 1 << 1;
        /// Not counted when deciding whether the system is idle.
        const DAEMON = 1 << 2;
    }
}

/// Snapshot of the kernel-owned facts about a process, filled in by
/// `get_process_info` for the holder of the process handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ProcessInfo {
    pub state: u32,
    pub policy: i32,
    pub tickets: i32,
    pub quanta_used: u32,
    pub flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub pgrp: u32,
}

/// Process states as reported in `ProcessInfo::state`.
pub mod state {
    pub const INIT: u32 = 100;
    pub const ZOMBIE: u32 = 200;
    pub const RUNNING: u32 = 300;
    pub const READY: u32 = 500;
    pub const SLEEP: u32 = 3000;
}
