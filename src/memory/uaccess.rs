//! Copying between kernel and user memory.
//!
//! The walks go through the owning process's page tables one page at a
//! time, so a syscall can only touch memory its caller actually has
//! mapped. A copy-out into a COW page breaks the share first, the same
//! way a user-mode write would.

use pionabi::SysError;

use super::pagefault::page_fault;
use super::pageframe::MemoryPool;
use super::pmap::Pmap;
use super::{page_align_down, phys_to_kva, PageFlags, VAddr, PAGE_SIZE, VM_USER_BASE, VM_USER_CEILING};

fn check_user_range(uva: VAddr, len: usize) -> Result<(), SysError> {
    let end = (uva as u64).checked_add(len as u64).ok_or(SysError::Param)?;
    if uva < VM_USER_BASE || end > VM_USER_CEILING as u64 {
        return Err(SysError::Param);
    }
    Ok(())
}

/// Copy `dst.len()` bytes from user address `src_uva` into the kernel.
pub fn copy_in(
    mem: &MemoryPool, pmap: &Pmap, src_uva: VAddr, dst: &mut [u8],
) -> Result<(), SysError> {
    check_user_range(src_uva, dst.len())?;

    let mut copied = 0usize;
    while copied < dst.len() {
        let va = src_uva + copied as u32;
        let page = page_align_down(va);
        let offset = (va - page) as usize;
        let chunk = (PAGE_SIZE - offset).min(dst.len() - copied);

        let (pa, flags) = pmap.extract(mem, page).ok_or(SysError::Memory)?;
        if !flags.contains(PageFlags::PROT_READ) {
            return Err(SysError::Memory);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_kva(pa).add(offset),
                dst.as_mut_ptr().add(copied),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `src` to user address `dst_uva`.
pub fn copy_out(
    mem: &mut MemoryPool, pmap: &mut Pmap, dst_uva: VAddr, src: &[u8],
) -> Result<(), SysError> {
    check_user_range(dst_uva, src.len())?;

    let mut copied = 0usize;
    while copied < src.len() {
        let va = dst_uva + copied as u32;
        let page = page_align_down(va);
        let offset = (va - page) as usize;
        let chunk = (PAGE_SIZE - offset).min(src.len() - copied);

        let (_, flags) = pmap.extract(mem, page).ok_or(SysError::Memory)?;
        if !flags.writable() {
            return Err(SysError::Memory);
        }
        if flags.cow() {
            page_fault(mem, pmap, page, PageFlags::PROT_WRITE.bits())?;
        }
        let (pa, _) = pmap.extract(mem, page).ok_or(SysError::Memory)?;

        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                phys_to_kva(pa).add(offset),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// View a `repr(C)` value as bytes for `copy_out`.
pub fn struct_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pageframe::FRAME_64K;

    fn setup_mapped_page(flags: PageFlags) -> (MemoryPool, Pmap, VAddr) {
        let mut mem = MemoryPool::with_test_arena(16 * FRAME_64K);
        let mut pmap = Pmap::new();
        pmap.create(&mut mem).unwrap();
        let f = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        mem.frame_mut(f).reference_cnt = 1;
        let pa = mem.pa(f);
        let va: VAddr = 0x0100_0000;
        pmap.enter(&mut mem, va, pa, flags).unwrap();
        (mem, pmap, va)
    }

    #[test]
    fn round_trip_within_one_page() {
        let (mut mem, mut pmap, va) =
            setup_mapped_page(PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC);
        copy_out(&mut mem, &mut pmap, va + 100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        copy_in(&mem, &pmap, va + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn crossing_a_page_boundary() {
        let (mut mem, mut pmap, va) =
            setup_mapped_page(PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC);
        // Map the next page too.
        let f = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        mem.frame_mut(f).reference_cnt = 1;
        let pa = mem.pa(f);
        pmap.enter(
            &mut mem,
            va + PAGE_SIZE as u32,
            pa,
            PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC,
        )
        .unwrap();

        let data: Vec<u8> = (0u8..64).collect();
        let start = va + PAGE_SIZE as u32 - 32;
        copy_out(&mut mem, &mut pmap, start, &data).unwrap();
        let mut back = vec![0u8; 64];
        copy_in(&mem, &pmap, start, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn unmapped_target_is_memory_error() {
        let (mem, pmap, va) = setup_mapped_page(PageFlags::PROT_READ | PageFlags::MEM_ALLOC);
        let mut buf = [0u8; 8];
        assert_eq!(
            copy_in(&mem, &pmap, va + 2 * PAGE_SIZE as u32, &mut buf),
            Err(SysError::Memory)
        );
    }

    #[test]
    fn kernel_range_is_rejected() {
        let (mut mem, mut pmap, _) =
            setup_mapped_page(PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC);
        let mut buf = [0u8; 4];
        assert_eq!(copy_in(&mem, &pmap, 0x1000, &mut buf), Err(SysError::Param));
        assert_eq!(
            copy_out(&mut mem, &mut pmap, VM_USER_CEILING - 2, b"abcd"),
            Err(SysError::Param)
        );
    }

    #[test]
    fn copy_out_breaks_cow() {
        let (mut mem, mut pmap, va) = setup_mapped_page(
            PageFlags::PROT_READ
                | PageFlags::PROT_WRITE
                | PageFlags::MAP_COW
                | PageFlags::MEM_ALLOC,
        );
        // Pretend another address space shares the frame.
        let (pa, _) = pmap.extract(&mem, va).unwrap();
        let idx = mem.frame_index(pa).unwrap();
        mem.frame_mut(idx).reference_cnt = 2;

        copy_out(&mut mem, &mut pmap, va, b"x").unwrap();

        let (new_pa, flags) = pmap.extract(&mem, va).unwrap();
        assert_ne!(new_pa, pa);
        assert!(!flags.cow());
        assert_eq!(mem.frame(idx).reference_cnt, 1);
    }

    #[test]
    fn copy_out_to_readonly_fails() {
        let (mut mem, mut pmap, va) = setup_mapped_page(PageFlags::PROT_READ | PageFlags::MEM_ALLOC);
        assert_eq!(copy_out(&mut mem, &mut pmap, va, b"x"), Err(SysError::Memory));
    }
}
