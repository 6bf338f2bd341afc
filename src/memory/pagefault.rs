//! Page fault classification and copy-on-write service.
//!
//! Only one kind of fault is ever serviced: a write to a present,
//! allocation-backed, copy-on-write page. Everything else kills the
//! faulting process. Kernel-mode faults never reach this code; the
//! exception entry panics on them first.

use pionabi::SysError;

use super::pageframe::MemoryPool;
use super::pmap::Pmap;
use super::{page_align_down, phys_to_kva, PageFlags, VAddr, PAGE_SIZE};
use crate::arch::{flush_tlb, EI_PAGEFAULT, TsFlags};
use crate::kernel::Kernel;

/// Service a user-mode fault at `addr` with the given access kind
/// (`PROT_WRITE` bit set for write faults). `Err` means the access is not
/// serviceable and the process must die.
pub fn page_fault(
    mem: &mut MemoryPool, pmap: &mut Pmap, addr: VAddr, access: u32,
) -> Result<(), SysError> {
    let addr = page_align_down(addr);

    // Only the user window is ever serviced; kernel addresses cannot
    // fault their way to a COW copy.
    if addr < super::VM_USER_BASE || addr >= super::VM_USER_CEILING {
        return Err(SysError::Memory);
    }

    let (pa, flags) = match pmap.extract(mem, addr) {
        Some(entry) => entry,
        // No support for lazy population: not present means not mapped.
        None => return Err(SysError::Memory),
    };

    if flags.is_phys() {
        return Err(SysError::Memory);
    }
    if !flags.is_alloc() {
        return Err(SysError::Memory);
    }
    if access & PageFlags::PROT_WRITE.bits() == 0 {
        return Err(SysError::Memory);
    }
    if flags.writable() && !flags.cow() {
        // Spurious: the mapping already permits the write.
        return Err(SysError::Memory);
    }
    if !(flags.writable() && flags.cow()) {
        return Err(SysError::Memory);
    }

    let idx = mem.frame_index(pa).ok_or(SysError::Memory)?;
    let refcnt = mem.frame(idx).reference_cnt;
    let new_flags = (flags | PageFlags::PROT_WRITE) - PageFlags::MAP_COW;

    if refcnt > 1 {
        // Shared frame: duplicate it for the writer.
        mem.frame_mut(idx).reference_cnt -= 1;
        pmap.remove(mem, addr)?;

        let new_idx = match mem.alloc(PAGE_SIZE) {
            Some(i) => i,
            None => return Err(SysError::Memory),
        };
        let new_pa = mem.pa(new_idx);
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_kva(pa), phys_to_kva(new_pa), PAGE_SIZE);
        }

        if let Err(e) = pmap.enter(mem, addr, new_pa, new_flags) {
            flush_tlb();
            mem.free(new_idx);
            return Err(e);
        }
        mem.frame_mut(new_idx).reference_cnt = 1;
        flush_tlb();
    } else if refcnt == 1 {
        // Sole owner: just drop the COW bit in place.
        pmap.remove(mem, addr)?;
        if let Err(e) = pmap.enter(mem, addr, pa, new_flags) {
            flush_tlb();
            return Err(e);
        }
        flush_tlb();
    } else {
        panic!("COW page with zero references at {:#x}", addr);
    }

    Ok(())
}

/// Fault entry from the exception path: service the fault or mark the
/// current process for termination at the next kernel exit.
pub fn handle_fault(kernel: &mut Kernel, addr: VAddr, access: u32) {
    log::trace!("page fault addr={:#x} access={:#x}", addr, access);
    let current = kernel.current();
    let Kernel { mem, procs, .. } = kernel;
    let proc = procs.get_mut(&current).expect("no current process");

    match page_fault(mem, &mut proc.pmap, addr, access) {
        Ok(()) => {},
        Err(_) => {
            log::debug!("unserviceable fault at {:#x}, killing process", addr);
            proc.task_state.flags |= TsFlags::EXCEPTION;
            proc.task_state.exception = EI_PAGEFAULT;
            proc.task_state.fault_addr = addr;
            proc.task_state.fault_access = access;
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::addrspace::{fork_address_space, AddressSpace};
    use crate::memory::pageframe::FRAME_64K;

    fn setup_cow_pair() -> (MemoryPool, Pmap, Pmap, VAddr, usize) {
        let mut mem = MemoryPool::with_test_arena(64 * FRAME_64K);
        let mut parent = Pmap::new();
        parent.create(&mut mem).unwrap();
        let parent_as = AddressSpace::new();

        let va: VAddr = 0x0100_0000;
        let f = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        mem.frame_mut(f).reference_cnt = 1;
        let pa = mem.pa(f);
        unsafe { core::ptr::write_bytes(phys_to_kva(pa), 0xa5, PAGE_SIZE) };
        parent
            .enter(
                &mut mem,
                va,
                pa,
                PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC,
            )
            .unwrap();

        let mut child = Pmap::new();
        let mut child_as = AddressSpace::new();
        fork_address_space(&mut mem, &mut child, &mut child_as, &mut parent, &parent_as).unwrap();
        (mem, parent, child, va, f)
    }

    #[test]
    fn cow_write_with_shared_frame_copies() {
        let (mut mem, mut parent, child, va, f) = setup_cow_pair();
        assert_eq!(mem.frame(f).reference_cnt, 2);

        // Parent writes: gets a private copy, child keeps the original.
        page_fault(&mut mem, &mut parent, va, PageFlags::PROT_WRITE.bits()).unwrap();

        let (ppa, pflags) = parent.extract(&mem, va).unwrap();
        let (cpa, cflags) = child.extract(&mem, va).unwrap();
        assert_ne!(ppa, cpa);
        assert!(pflags.writable() && !pflags.cow());
        assert!(cflags.cow());

        // Contents were copied; writer's frame has a single reference.
        unsafe {
            assert_eq!(*phys_to_kva(ppa), 0xa5);
            assert_eq!(*phys_to_kva(cpa), 0xa5);
            *phys_to_kva(ppa) = 0x5a;
            assert_eq!(*phys_to_kva(cpa), 0xa5);
        }
        let pidx = mem.frame_index(ppa).unwrap();
        assert_eq!(mem.frame(pidx).reference_cnt, 1);
        assert_eq!(mem.frame(f).reference_cnt, 1);
    }

    #[test]
    fn cow_write_with_sole_reference_remaps_in_place() {
        let (mut mem, mut parent, mut child, va, f) = setup_cow_pair();

        page_fault(&mut mem, &mut parent, va, PageFlags::PROT_WRITE.bits()).unwrap();
        assert_eq!(mem.frame(f).reference_cnt, 1);

        // Child is now the sole owner of the original frame; its write
        // clears COW without copying.
        page_fault(&mut mem, &mut child, va, PageFlags::PROT_WRITE.bits()).unwrap();
        let (cpa, cflags) = child.extract(&mem, va).unwrap();
        assert_eq!(mem.frame_index(cpa).unwrap(), f);
        assert!(cflags.writable() && !cflags.cow());
        assert_eq!(mem.frame(f).reference_cnt, 1);
    }

    #[test]
    fn non_write_faults_are_fatal() {
        let (mut mem, mut parent, _child, va, _f) = setup_cow_pair();
        assert!(page_fault(&mut mem, &mut parent, va, PageFlags::PROT_READ.bits()).is_err());
    }

    #[test]
    fn kernel_addresses_are_never_serviced() {
        let mut mem = MemoryPool::with_test_arena(16 * FRAME_64K);
        let mut pmap = Pmap::new();
        pmap.create(&mut mem).unwrap();
        assert!(page_fault(&mut mem, &mut pmap, 0x1000, PageFlags::PROT_WRITE.bits()).is_err());
        assert!(
            page_fault(&mut mem, &mut pmap, 0x8000_0000, PageFlags::PROT_WRITE.bits()).is_err()
        );
    }

    #[test]
    fn unmapped_and_phys_faults_are_fatal() {
        let mut mem = MemoryPool::with_test_arena(16 * FRAME_64K);
        let mut pmap = Pmap::new();
        pmap.create(&mut mem).unwrap();

        assert!(page_fault(&mut mem, &mut pmap, 0x0400_0000, PageFlags::PROT_WRITE.bits()).is_err());

        pmap.enter(
            &mut mem,
            0x0500_0000,
            0x2000_0000,
            PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_PHYS,
        )
        .unwrap();
        assert!(
            page_fault(&mut mem, &mut pmap, 0x0500_0000, PageFlags::PROT_WRITE.bits()).is_err()
        );
    }

    #[test]
    fn write_to_writable_non_cow_is_spurious() {
        let mut mem = MemoryPool::with_test_arena(16 * FRAME_64K);
        let mut pmap = Pmap::new();
        pmap.create(&mut mem).unwrap();
        let f = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        mem.frame_mut(f).reference_cnt = 1;
        let pa = mem.pa(f);
        pmap.enter(
            &mut mem,
            0x0100_0000,
            pa,
            PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC,
        )
        .unwrap();
        assert!(
            page_fault(&mut mem, &mut pmap, 0x0100_0000, PageFlags::PROT_WRITE.bits()).is_err()
        );
    }
}
