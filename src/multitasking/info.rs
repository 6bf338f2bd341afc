//! Process information and identity syscalls.

use pionabi::process::ProcessInfo;
use pionabi::{Handle, SysError, NSYSPORT};

use crate::kernel::{KResult, Kernel};
use crate::memory::uaccess;
use crate::multitasking::handle::{HandleObject, HandleType};

impl Kernel {
    /// `get_system_ports`: copy out up to `count` of the well-known
    /// handle slots wired up at spawn.
    pub fn sys_get_system_ports(&mut self, ports_uva: u32, count: u32) -> KResult<i32> {
        let count = (count as usize).min(NSYSPORT);
        let current = self.current();
        let ports = self.procs[&current].system_ports;

        let mut bytes = [0u8; 4 * NSYSPORT];
        for i in 0..count {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&ports[i].to_ne_bytes());
        }
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get_mut(&current).expect("no current");
        uaccess::copy_out(mem, &mut proc.pmap, ports_uva, &bytes[..count * 4])?;
        Ok(count as i32)
    }

    /// `get_process_info`: the kernel-owned facts about a process, for
    /// the holder of its handle (or for the caller itself with -1).
    pub fn sys_get_process_info(&mut self, h: Handle, info_uva: u32) -> KResult<i32> {
        let current = self.current();
        let target = if h == -1 {
            current
        } else {
            match self.handles.object_of(current, h, HandleType::Process)? {
                HandleObject::Process(pid) => pid,
                _ => return Err(SysError::Param.into()),
            }
        };

        let info = {
            let proc = self.procs.get(&target).ok_or(SysError::Param)?;
            ProcessInfo {
                state: proc.state.as_abi(),
                policy: proc.sched_policy,
                tickets: proc.tickets,
                quanta_used: proc.quanta_used,
                flags: proc.flags.bits(),
                uid: proc.uid,
                gid: proc.gid,
                pgrp: proc.pgrp,
            }
        };

        let Kernel { mem, procs, .. } = self;
        let proc = procs.get_mut(&current).expect("no current");
        uaccess::copy_out(mem, &mut proc.pmap, info_uva, uaccess::struct_bytes(&info))?;
        Ok(0)
    }

    /// `set_identity`: change uid/gid. Only uid 0 may raise privilege;
    /// anyone may drop to a higher (less privileged) id.
    pub fn sys_set_identity(&mut self, uid: u32, gid: u32) -> KResult<i32> {
        let cur = self.cur();
        if cur.uid != 0 && (uid < cur.uid || gid < cur.gid) {
            return Err(SysError::Privilege.into());
        }
        cur.uid = uid;
        cur.gid = gid;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KErr;
    use crate::memory::{PageFlags, PAGE_SIZE};
    use pionabi::process::{state, SCHED_OTHER};

    fn user_buf(k: &mut Kernel) -> u32 {
        let va = 0x0100_0000;
        assert_eq!(
            k.sys_virtualalloc(
                va,
                PAGE_SIZE as u32,
                (PageFlags::PROT_READ | PageFlags::PROT_WRITE).bits()
            )
            .unwrap() as usize,
            PAGE_SIZE
        );
        va
    }

    #[test]
    fn process_info_reports_self() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        k.sys_get_process_info(-1, buf).unwrap();

        let mut bytes = [0u8; core::mem::size_of::<ProcessInfo>()];
        let current = k.current();
        {
            let Kernel { mem, procs, .. } = &mut k;
            uaccess::copy_in(mem, &procs[&current].pmap, buf, &mut bytes).unwrap();
        }
        let info: ProcessInfo = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const _) };
        assert_eq!(info.state, state::RUNNING);
        assert_eq!(info.policy, SCHED_OTHER);
        assert_eq!(info.uid, 0);
    }

    #[test]
    fn identity_can_only_drop_without_uid0() {
        let mut k = Kernel::for_tests();
        k.sys_set_identity(1000, 100).unwrap();
        assert_eq!(k.cur().uid, 1000);
        // Raising back requires uid 0.
        assert!(matches!(
            k.sys_set_identity(0, 0),
            Err(KErr::Sys(SysError::Privilege))
        ));
        k.sys_set_identity(2000, 200).unwrap();
    }

    #[test]
    fn fork_inherits_identity() {
        let mut k = Kernel::for_tests();
        k.sys_set_identity(7, 8).unwrap();
        let h = k.sys_fork(0).unwrap();
        let child = match k.handles.get(h).unwrap().object {
            HandleObject::Process(pid) => pid,
            _ => unreachable!(),
        };
        assert_eq!(k.procs[&child].uid, 7);
        assert_eq!(k.procs[&child].gid, 8);
    }
}
