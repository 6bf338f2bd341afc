//! CPU-independent address space description and the fork/teardown walks.
//!
//! An address space is a sorted run of segments tiling the user range
//! `[VM_USER_BASE, VM_USER_CEILING)` with no gaps or overlap; the final
//! entry is a ceiling sentinel. A segment's ceiling is the next segment's
//! base.

use alloc::vec::Vec;
use pionabi::SysError;

use super::pageframe::MemoryPool;
use super::pmap::{Pmap, L2_SPAN};
use super::{PageFlags, VAddr, PAGE_SIZE, VM_USER_BASE, VM_USER_CEILING};
use crate::arch::flush_tlb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegType {
    Free,
    Alloc,
    Phys,
    Ceiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: VAddr,
    pub seg_type: SegType,
}

#[derive(Debug, Clone)]
pub struct AddressSpace {
    pub segments: Vec<Segment>,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            segments: vec![
                Segment {
                    base: VM_USER_BASE,
                    seg_type: SegType::Free,
                },
                Segment {
                    base: VM_USER_CEILING,
                    seg_type: SegType::Ceiling,
                },
            ],
        }
    }

    /// Binary search for the segment containing `addr`.
    pub fn find(&self, addr: VAddr) -> Option<usize> {
        if addr < VM_USER_BASE || addr >= VM_USER_CEILING {
            return None;
        }
        let mut low = 0;
        let mut high = self.segments.len() - 1; // exclude the sentinel
        while low < high {
            let mid = low + (high - low) / 2;
            if addr < self.segments[mid].base {
                high = mid;
            } else if addr >= self.ceiling_of(mid) {
                low = mid + 1;
            } else {
                return Some(mid);
            }
        }
        if low < self.segments.len() - 1 {
            Some(low)
        } else {
            None
        }
    }

    pub fn ceiling_of(&self, idx: usize) -> VAddr {
        self.segments[idx + 1].base
    }

    pub fn seg_type_at(&self, addr: VAddr) -> Option<SegType> {
        self.find(addr).map(|i| self.segments[i].seg_type)
    }

    /// Split the segment containing `addr` so a boundary falls at `addr`.
    fn insert_boundary(&mut self, addr: VAddr) {
        if addr >= VM_USER_CEILING {
            return;
        }
        if let Some(idx) = self.find(addr) {
            if self.segments[idx].base != addr {
                let seg_type = self.segments[idx].seg_type;
                self.segments.insert(idx + 1, Segment { base: addr, seg_type });
            }
        }
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.segments.len() {
            if self.segments[i].seg_type == self.segments[i + 1].seg_type {
                self.segments.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Retype an exact page-aligned range.
    fn set_range(&mut self, base: VAddr, len: u32, seg_type: SegType) {
        debug_assert_eq!(base as usize % PAGE_SIZE, 0);
        debug_assert_eq!(len as usize % PAGE_SIZE, 0);
        let ceiling = base.saturating_add(len).min(VM_USER_CEILING);
        self.insert_boundary(base);
        self.insert_boundary(ceiling);
        for seg in self.segments.iter_mut() {
            if seg.base >= base && seg.base < ceiling && seg.seg_type != SegType::Ceiling {
                seg.seg_type = seg_type;
            }
        }
        self.coalesce();
    }

    /// Reserve `len` bytes of the given type. With `Some(addr)` the range
    /// must currently be entirely free at that address; with `None` the
    /// lowest free fit is chosen.
    pub fn reserve(
        &mut self, addr: Option<VAddr>, len: u32, seg_type: SegType,
    ) -> Result<VAddr, SysError> {
        if len == 0 || len as usize % PAGE_SIZE != 0 {
            return Err(SysError::Param);
        }
        let base = match addr {
            Some(base) => {
                let idx = self.find(base).ok_or(SysError::Memory)?;
                if self.segments[idx].seg_type != SegType::Free
                    || base.checked_add(len).map_or(true, |c| c > self.ceiling_of(idx))
                {
                    return Err(SysError::Memory);
                }
                base
            },
            None => {
                let mut found = None;
                for idx in 0..self.segments.len() - 1 {
                    if self.segments[idx].seg_type == SegType::Free
                        && self.ceiling_of(idx) - self.segments[idx].base >= len
                    {
                        found = Some(self.segments[idx].base);
                        break;
                    }
                }
                found.ok_or(SysError::Memory)?
            },
        };
        self.set_range(base, len, seg_type);
        Ok(base)
    }

    /// Return a range to the free pool.
    pub fn release(&mut self, base: VAddr, len: u32) {
        self.set_range(base, len, SegType::Free);
    }

    /// Drop everything back to a single free segment.
    pub fn reset(&mut self) {
        *self = AddressSpace::new();
    }
}

/// Copy-on-write duplication of `old` into `new`.
///
/// Every present user page of the parent is shared with the child:
/// writable allocations are downgraded to read-only COW in both tables,
/// read-only allocations are shared directly, physical mappings are
/// duplicated without accounting. Reference counts track the sharers.
/// On any failure the partially built child is torn down.
pub fn fork_address_space(
    mem: &mut MemoryPool, new_pmap: &mut Pmap, new_as: &mut AddressSpace, old_pmap: &mut Pmap,
    old_as: &AddressSpace,
) -> Result<(), SysError> {
    new_pmap.create(mem)?;
    new_as.segments = old_as.segments.clone();

    let result = fork_walk(mem, new_pmap, old_pmap);
    match result {
        Ok(()) => {
            flush_tlb();
            Ok(())
        },
        Err(e) => {
            log::info!("fork_address_space failed: {}", e);
            cleanup_address_space(mem, new_pmap, new_as);
            new_pmap.destroy(mem);
            Err(e)
        },
    }
}

fn fork_walk(mem: &mut MemoryPool, new_pmap: &mut Pmap, old_pmap: &mut Pmap) -> Result<(), SysError> {
    let mut vpt = VM_USER_BASE;
    while vpt < VM_USER_CEILING {
        if !old_pmap.is_table_present(mem, vpt) {
            vpt += L2_SPAN;
            continue;
        }

        let span_end = vpt + L2_SPAN;
        let mut va = vpt;
        while va < span_end {
            let (pa, flags) = match old_pmap.extract(mem, va) {
                Some(entry) => entry,
                None => {
                    va += PAGE_SIZE as u32;
                    continue;
                },
            };

            if flags.is_phys() {
                new_pmap.enter(mem, va, pa, flags)?;
            } else if flags.writable() {
                // Read-write allocation: both sides become read-only COW.
                let cow_flags = flags | PageFlags::MAP_COW;
                old_pmap.protect(mem, va, cow_flags)?;
                new_pmap.enter(mem, va, pa, cow_flags)?;
                let idx = mem.frame_index(pa).ok_or(SysError::Memory)?;
                mem.frame_mut(idx).reference_cnt += 1;
            } else {
                // Read-only allocation: plain shared mapping.
                new_pmap.enter(mem, va, pa, flags)?;
                let idx = mem.frame_index(pa).ok_or(SysError::Memory)?;
                mem.frame_mut(idx).reference_cnt += 1;
            }

            va += PAGE_SIZE as u32;
        }
        vpt += L2_SPAN;
    }
    Ok(())
}

/// Remove and account every present user page. Allocation-backed frames
/// drop a reference and return to the pool at zero; physical mappings are
/// simply unmapped.
pub fn cleanup_address_space(mem: &mut MemoryPool, pmap: &mut Pmap, aspace: &mut AddressSpace) {
    let mut vpt = VM_USER_BASE;
    while vpt < VM_USER_CEILING {
        if !pmap.is_table_present(mem, vpt) {
            vpt += L2_SPAN;
            continue;
        }

        let span_end = vpt + L2_SPAN;
        let mut va = vpt;
        while va < span_end {
            if let Ok((pa, flags)) = pmap.remove(mem, va) {
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
            }
            va += PAGE_SIZE as u32;
        }
        vpt += L2_SPAN;
    }

    aspace.reset();
    flush_tlb();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pageframe::FRAME_64K;

    #[test]
    fn new_space_is_one_free_segment() {
        let aspace = AddressSpace::new();
        assert_eq!(aspace.segments.len(), 2);
        assert_eq!(aspace.seg_type_at(VM_USER_BASE), Some(SegType::Free));
        assert_eq!(aspace.seg_type_at(VM_USER_CEILING - 1), Some(SegType::Free));
        assert_eq!(aspace.seg_type_at(VM_USER_CEILING), None);
        assert_eq!(aspace.seg_type_at(0), None);
    }

    #[test]
    fn reserve_fixed_and_release() {
        let mut aspace = AddressSpace::new();
        let base = 0x0100_0000;
        let got = aspace.reserve(Some(base), 0x4000, SegType::Alloc).unwrap();
        assert_eq!(got, base);
        assert_eq!(aspace.seg_type_at(base), Some(SegType::Alloc));
        assert_eq!(aspace.seg_type_at(base + 0x3fff), Some(SegType::Alloc));
        assert_eq!(aspace.seg_type_at(base + 0x4000), Some(SegType::Free));

        // Overlapping reservation is refused.
        assert!(aspace.reserve(Some(base + 0x1000), 0x1000, SegType::Phys).is_err());

        aspace.release(base, 0x4000);
        assert_eq!(aspace.segments.len(), 2);
    }

    #[test]
    fn reserve_first_fit_skips_used_ranges() {
        let mut aspace = AddressSpace::new();
        let a = aspace.reserve(None, 0x2000, SegType::Alloc).unwrap();
        assert_eq!(a, VM_USER_BASE);
        let b = aspace.reserve(None, 0x2000, SegType::Alloc).unwrap();
        assert_eq!(b, VM_USER_BASE + 0x2000);

        aspace.release(a, 0x2000);
        let c = aspace.reserve(None, 0x1000, SegType::Phys).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn segments_always_tile_the_user_range() {
        let mut aspace = AddressSpace::new();
        aspace.reserve(Some(0x0200_0000), 0x3000, SegType::Alloc).unwrap();
        aspace.reserve(Some(0x0300_0000), 0x1000, SegType::Phys).unwrap();
        aspace.release(0x0200_1000, 0x1000);

        assert_eq!(aspace.segments[0].base, VM_USER_BASE);
        for i in 0..aspace.segments.len() - 1 {
            assert!(aspace.segments[i].base < aspace.segments[i + 1].base);
        }
        let last = aspace.segments.last().unwrap();
        assert_eq!(last.base, VM_USER_CEILING);
        assert_eq!(last.seg_type, SegType::Ceiling);
    }

    fn write_page(pa: usize, value: u8) {
        unsafe {
            core::ptr::write_bytes(crate::memory::phys_to_kva(pa), value, PAGE_SIZE);
        }
    }

    fn read_byte(pa: usize) -> u8 {
        unsafe { *crate::memory::phys_to_kva(pa) }
    }

    #[test]
    fn fork_marks_writable_pages_cow_and_bumps_refcount() {
        let mut mem = MemoryPool::with_test_arena(64 * FRAME_64K);
        let mut parent_pmap = Pmap::new();
        parent_pmap.create(&mut mem).unwrap();
        let mut parent_as = AddressSpace::new();

        let rw = PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC;
        let ro = PageFlags::PROT_READ | PageFlags::MEM_ALLOC;

        let va_rw: VAddr = 0x0100_0000;
        let va_ro: VAddr = 0x0200_0000;
        let f_rw = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        let f_ro = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        mem.frame_mut(f_rw).reference_cnt = 1;
        mem.frame_mut(f_ro).reference_cnt = 1;
        let pa_rw = mem.pa(f_rw);
        let pa_ro = mem.pa(f_ro);
        parent_as.reserve(Some(va_rw), PAGE_SIZE as u32, SegType::Alloc).unwrap();
        parent_as.reserve(Some(va_ro), PAGE_SIZE as u32, SegType::Alloc).unwrap();
        parent_pmap.enter(&mut mem, va_rw, pa_rw, rw).unwrap();
        parent_pmap.enter(&mut mem, va_ro, pa_ro, ro).unwrap();
        write_page(pa_rw, 0xa5);

        let mut child_pmap = Pmap::new();
        let mut child_as = AddressSpace::new();
        fork_address_space(&mut mem, &mut child_pmap, &mut child_as, &mut parent_pmap, &parent_as)
            .unwrap();

        // Same segments on both sides.
        assert_eq!(child_as.segments, parent_as.segments);

        // Writable page: shared, COW both sides, refcount 2.
        let (cpa, cflags) = child_pmap.extract(&mem, va_rw).unwrap();
        let (ppa, pflags) = parent_pmap.extract(&mem, va_rw).unwrap();
        assert_eq!(cpa, pa_rw);
        assert_eq!(ppa, pa_rw);
        assert!(cflags.cow() && pflags.cow());
        assert_eq!(mem.frame(f_rw).reference_cnt, 2);
        assert_eq!(read_byte(cpa), 0xa5);

        // Read-only page: shared without COW.
        let (_, roflags) = child_pmap.extract(&mem, va_ro).unwrap();
        assert!(!roflags.cow());
        assert_eq!(mem.frame(f_ro).reference_cnt, 2);

        // Cleanup of the child leaves the parent's pages alive.
        cleanup_address_space(&mut mem, &mut child_pmap, &mut child_as);
        child_pmap.destroy(&mut mem);
        assert_eq!(mem.frame(f_rw).reference_cnt, 1);
        assert_eq!(mem.frame(f_ro).reference_cnt, 1);
        assert!(parent_pmap.extract(&mem, va_rw).is_some());
    }

    #[test]
    fn cleanup_returns_frames_at_zero_references() {
        let mut mem = MemoryPool::with_test_arena(64 * FRAME_64K);
        let mut pmap = Pmap::new();
        pmap.create(&mut mem).unwrap();
        let mut aspace = AddressSpace::new();

        let flags = PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC;
        for i in 0..4u32 {
            let f = mem.alloc_zeroed(PAGE_SIZE).unwrap();
            mem.frame_mut(f).reference_cnt = 1;
            let pa = mem.pa(f);
            pmap.enter(&mut mem, 0x0100_0000 + i * PAGE_SIZE as u32, pa, flags).unwrap();
        }
        let in_use_before = mem.in_use_pages_4k();

        cleanup_address_space(&mut mem, &mut pmap, &mut aspace);
        pmap.destroy(&mut mem);
        assert_eq!(mem.in_use_pages_4k(), 0);
        assert!(in_use_before > 0);
        assert_eq!(aspace.segments.len(), 2);
    }
}
