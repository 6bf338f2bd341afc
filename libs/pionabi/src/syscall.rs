//! Stable system call numbers.
//!
//! The kernel dispatches on the value in `r7` at the SWI instruction;
//! arguments travel in `r0..r3` and the result (or negative error code)
//! comes back in `r0`.

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SysCallNumber {
    exit = 0x00,
    fork = 0x01,
    join = 0x02,
    yield_cpu = 0x03,
    set_sched_params = 0x04,
    close_handle = 0x05,
    wait_event = 0x06,
    check_event = 0x07,

    virtualalloc = 0x10,
    virtualallocphys = 0x11,
    virtualfree = 0x12,
    virtualprotect = 0x13,

    create_channel = 0x20,
    put_msg = 0x21,
    get_msg = 0x22,
    put_handle = 0x23,
    get_handle = 0x24,
    is_a_channel = 0x25,
    create_notification = 0x26,
    put_notification = 0x27,
    get_notification = 0x28,

    create_timer = 0x30,
    set_timer = 0x31,
    set_timeout = 0x32,

    create_interrupt = 0x40,
    mask_interrupt = 0x41,
    unmask_interrupt = 0x42,

    get_system_ports = 0x50,
    get_process_info = 0x51,
    set_identity = 0x52,
}

impl SysCallNumber {
    pub fn from_u32(raw: u32) -> Option<SysCallNumber> {
        use SysCallNumber::*;
        Some(match raw {
            0x00 => exit,
            0x01 => fork,
            0x02 => join,
            0x03 => yield_cpu,
            0x04 => set_sched_params,
            0x05 => close_handle,
            0x06 => wait_event,
            0x07 => check_event,
            0x10 => virtualalloc,
            0x11 => virtualallocphys,
            0x12 => virtualfree,
            0x13 => virtualprotect,
            0x20 => create_channel,
            0x21 => put_msg,
            0x22 => get_msg,
            0x23 => put_handle,
            0x24 => get_handle,
            0x25 => is_a_channel,
            0x26 => create_notification,
            0x27 => put_notification,
            0x28 => get_notification,
            0x30 => create_timer,
            0x31 => set_timer,
            0x32 => set_timeout,
            0x40 => create_interrupt,
            0x41 => mask_interrupt,
            0x42 => unmask_interrupt,
            0x50 => get_system_ports,
            0x51 => get_process_info,
            0x52 => set_identity,
            _ => return None,
        })
    }
}
