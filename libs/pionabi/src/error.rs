use core::fmt;

/// The closed kernel error taxonomy. System calls report failure as the
/// negative numeric value of one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SysError {
    /// Catch-all for conditions with no better classification
    Undefined = -1,
    /// Handle exists but names the wrong kind of object
    Handle = -9,
    /// Caller lacks the privilege (allow-io, uid) for the operation
    Privilege = -10,
    /// Malformed argument: bad handle number, bad range, bad flag bits
    Param = -11,
    /// A fixed kernel table (handles, processes, timers, ...) is exhausted
    Resource = -12,
    /// Out of physical memory, or an unserviceable memory access
    Memory = -13,
    /// Message-passing failure on a channel or message port
    Message = -14,
    /// The peer endpoint is gone
    Connection = -15,
    /// Timer/timeout failure
    Alarm = -16,
}

impl SysError {
    /// The raw negative code as returned from a system call.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reverse mapping, for userspace decoding syscall returns.
    pub fn from_code(code: i32) -> Option<SysError> {
        Some(match code {
            -1 => SysError::Undefined,
            -9 => SysError::Handle,
            -10 => SysError::Privilege,
            -11 => SysError::Param,
            -12 => SysError::Resource,
            -13 => SysError::Memory,
            -14 => SysError::Message,
            -15 => SysError::Connection,
            -16 => SysError::Alarm,
            _ => return None,
        })
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SysError::Undefined => "undefinedErr",
            SysError::Handle => "handleErr",
            SysError::Privilege => "privilegeErr",
            SysError::Param => "paramErr",
            SysError::Resource => "resourceErr",
            SysError::Memory => "memoryErr",
            SysError::Message => "messageErr",
            SysError::Connection => "connectionErr",
            SysError::Alarm => "alarmErr",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for e in [
            SysError::Undefined,
            SysError::Handle,
            SysError::Privilege,
            SysError::Param,
            SysError::Resource,
            SysError::Memory,
            SysError::Message,
            SysError::Connection,
            SysError::Alarm,
        ]
        .iter()
        {
            assert_eq!(SysError::from_code(e.code()), Some(*e));
        }
        assert_eq!(SysError::from_code(0), None);
        assert_eq!(SysError::from_code(-2), None);
    }
}
