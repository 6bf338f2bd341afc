//! Kernel/userspace ABI definitions shared by the pion kernel and the
//! userspace runtime. Everything here is `no_std` and representation-stable:
//! the kernel copies some of these types directly into process memory.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;

mod error;
pub mod process;
pub mod syscall;
pub mod vm;

pub use self::error::SysError;

/// A handle: a small per-process integer naming any kernel object.
///
/// Userspace only ever sees the raw `i32`; negative values returned from
/// system calls are error codes, not handles. `HANDLE_ANY` may be passed to
/// `wait_event` to wait on all owned handles at once.
pub type Handle = i32;

/// Wildcard handle accepted by `wait_event`.
pub const HANDLE_ANY: Handle = -1;

/// Number of well-known handle slots transferred at spawn.
pub const NSYSPORT: usize = 8;

/// Indices into the system port array.
pub mod sysport {
    pub const SYSTEM: usize = 0;
    pub const EXCEPTION: usize = 1;
    pub const ROOT_DIR: usize = 2;
    pub const PROGRAM_DIR: usize = 3;
    pub const CURRENT_DIR: usize = 4;
    pub const STDIN: usize = 5;
    pub const STDOUT: usize = 6;
    pub const STDERR: usize = 7;
}
