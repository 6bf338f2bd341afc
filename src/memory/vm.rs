//! The `virtualalloc` family of system calls.
//!
//! These are byte-count operations: they map/unmap/retune as much of the
//! request as they can and report how far they got; errors surface as a
//! short count, not a failure code (privilege being the exception).

use pionabi::process::ProcFlags;
use pionabi::vm::MapFlags;
use pionabi::SysError;

use super::addrspace::SegType;
use super::{page_align_down, page_align_up, PageFlags, PAGE_SIZE};
use crate::arch::flush_tlb;
use crate::kernel::{KResult, Kernel};

/// Translate the user flag word into kernel page flags.
fn user_flags(raw: u32) -> PageFlags {
    let keep = raw & (MapFlags::PROT_MASK | MapFlags::CACHE_MASK);
    PageFlags::from_bits_truncate(keep)
}

impl Kernel {
    /// `virtualalloc`: map `len` bytes of zeroed memory at `addr` (or
    /// anywhere for 0). Returns bytes actually mapped.
    pub fn sys_virtualalloc(&mut self, addr: u32, len: u32, raw_flags: u32) -> KResult<i32> {
        let addr = page_align_down(addr);
        let len = page_align_up(len);
        if len == 0 {
            return Ok(0);
        }
        let flags = user_flags(raw_flags) | PageFlags::MEM_ALLOC;
        let current = self.current();

        let base = {
            let proc = self.procs.get_mut(&current).expect("no current");
            let want = if addr == 0 { None } else { Some(addr) };
            match proc.aspace.reserve(want, len, SegType::Alloc) {
                Ok(base) => base,
                Err(_) => return Ok(0),
            }
        };

        let mut mapped: u32 = 0;
        while mapped < len {
            let va = base + mapped;
            let ok = {
                let Kernel { mem, procs, .. } = self;
                let proc = procs.get_mut(&current).expect("no current");
                match mem.alloc_zeroed(PAGE_SIZE) {
                    Some(idx) => {
                        let pa = mem.pa(idx);
                        match proc.pmap.enter(mem, va, pa, flags) {
                            Ok(()) => {
                                mem.frame_mut(idx).reference_cnt = 1;
                                true
                            },
                            Err(_) => {
                                mem.free(idx);
                                false
                            },
                        }
                    },
                    None => false,
                }
            };
            if !ok {
                break;
            }
            mapped += PAGE_SIZE as u32;
        }

        if mapped < len {
            // Give the unreachable tail of the reservation back.
            let proc = self.procs.get_mut(&current).expect("no current");
            proc.aspace.release(base + mapped, len - mapped);
        }
        flush_tlb();
        Ok(mapped as i32)
    }

    /// `virtualallocphys`: map a physical range (device registers,
    /// framebuffer). Allow-io only.
    pub fn sys_virtualallocphys(
        &mut self, addr: u32, len: u32, raw_flags: u32, paddr: u32,
    ) -> KResult<i32> {
        let current = self.current();
        if !self.procs[&current].flags.contains(ProcFlags::ALLOW_IO) {
            return Err(SysError::Privilege.into());
        }

        let addr = page_align_down(addr);
        let paddr = page_align_down(paddr);
        let len = page_align_up(len);
        if len == 0 {
            return Ok(0);
        }
        let flags = user_flags(raw_flags) | PageFlags::MEM_PHYS;

        let base = {
            let proc = self.procs.get_mut(&current).expect("no current");
            let want = if addr == 0 { None } else { Some(addr) };
            match proc.aspace.reserve(want, len, SegType::Phys) {
                Ok(base) => base,
                Err(_) => return Ok(0),
            }
        };

        let mut mapped: u32 = 0;
        while mapped < len {
            let va = base + mapped;
            let pa = (paddr + mapped) as usize;
            let ok = {
                let Kernel { mem, procs, .. } = self;
                let proc = procs.get_mut(&current).expect("no current");
                proc.pmap.enter(mem, va, pa, flags).is_ok()
            };
            if !ok {
                break;
            }
            mapped += PAGE_SIZE as u32;
        }

        if mapped < len {
            let proc = self.procs.get_mut(&current).expect("no current");
            proc.aspace.release(base + mapped, len - mapped);
        }
        flush_tlb();
        Ok(mapped as i32)
    }

    /// `virtualfree`: unmap a range, returning pool pages whose last
    /// reference dropped. Returns bytes freed.
    pub fn sys_virtualfree(&mut self, addr: u32, len: u32) -> KResult<i32> {
        let addr = page_align_down(addr);
        let len = page_align_up(len);
        let current = self.current();

        let mut freed: u32 = 0;
        let mut va = addr;
        while va < addr.saturating_add(len) {
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&current).expect("no current");
            if let Ok((pa, flags)) = proc.pmap.remove(mem, va) {
                if flags.is_alloc() {
                    if let Some(idx) = mem.frame_index(pa) {
                        let frame = mem.frame_mut(idx);
                        debug_assert!(frame.reference_cnt > 0);
                        frame.reference_cnt -= 1;
                        if frame.reference_cnt == 0 {
                            mem.free(idx);
                        }
                    }
                }
                freed += PAGE_SIZE as u32;
            }
            va += PAGE_SIZE as u32;
        }

        let proc = self.procs.get_mut(&current).expect("no current");
        proc.aspace.release(addr, len);
        flush_tlb();
        Ok(freed as i32)
    }

    /// `virtualprotect`: change protection bits only. COW marking and
    /// the memory-type accounting are untouched. Returns bytes changed.
    pub fn sys_virtualprotect(&mut self, addr: u32, len: u32, raw_flags: u32) -> KResult<i32> {
        let addr = page_align_down(addr);
        let len = page_align_up(len);
        let prot = user_flags(raw_flags);
        let current = self.current();

        let mut changed: u32 = 0;
        let mut va = addr;
        while va < addr.saturating_add(len) {
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&current).expect("no current");
            let existing = match proc.pmap.extract(mem, va) {
                Some((_, flags)) => flags,
                None => break,
            };
            let keep_cow = existing & PageFlags::MAP_COW;
            if proc.pmap.protect(mem, va, prot | keep_cow).is_err() {
                break;
            }
            changed += PAGE_SIZE as u32;
            va += PAGE_SIZE as u32;
        }

        flush_tlb();
        Ok(changed as i32)
    }
}
