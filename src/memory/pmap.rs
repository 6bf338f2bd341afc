//! CPU-dependent page table management.
//!
//! Two-level ARM-style tables: a 4096-entry top-level directory covering
//! 4 GiB in 1 MiB spans, and per-span second-level tables of 256 leaf
//! entries, allocated lazily on the first mapping in their span.
//!
//! A second-level frame holds the table the MMU walks plus a shadow word
//! per entry carrying the software flags (`PageFlags`) that do not fit in
//! the hardware descriptor.

use bit_field::BitField;
use pionabi::SysError;
use static_assertions::const_assert;

use super::pageframe::{MemoryPool, FRAME_4K};
use super::{phys_to_kva, PAddr, PageFlags, VAddr, PAGE_SIZE};

pub const L1_ENTRIES: usize = 4096;
pub const L2_ENTRIES: usize = 256;

/// Virtual bytes covered by one second-level table.
pub const L2_SPAN: u32 = (L2_ENTRIES * PAGE_SIZE) as u32;

/// Low bit marks an entry as present; the rest of the word is the
/// (page-aligned) physical address.
const ENTRY_PRESENT: usize = 1;

type L1Table = [usize; L1_ENTRIES];

#[repr(C)]
struct L2Table {
    /// Descriptors the MMU walks. On the target these carry the ARMv6
    /// small-page encoding derived from the shadow flags.
    hw: [usize; L2_ENTRIES],
    /// Software view: full `PageFlags` bits per entry.
    flags: [u32; L2_ENTRIES],
}

const_assert!(core::mem::size_of::<L2Table>() <= FRAME_4K);

/// Page table state of one process.
#[derive(Debug)]
pub struct Pmap {
    /// Frame index of the top-level table, if created.
    l1_frame: Option<usize>,
}

impl Pmap {
    pub const fn new() -> Self {
        Pmap { l1_frame: None }
    }

    /// Allocate the (zeroed) top-level table.
    pub fn create(&mut self, mem: &mut MemoryPool) -> Result<(), SysError> {
        debug_assert!(self.l1_frame.is_none());
        let idx = mem
            .alloc_zeroed(core::mem::size_of::<L1Table>())
            .ok_or(SysError::Resource)?;
        self.l1_frame = Some(idx);
        Ok(())
    }

    pub fn is_created(&self) -> bool {
        self.l1_frame.is_some()
    }

    /// Physical address of the top-level table, for TTBR loads.
    pub fn l1_phys(&self, mem: &MemoryPool) -> Option<PAddr> {
        self.l1_frame.map(|idx| mem.pa(idx))
    }

    /// Tear down the table structure itself. Leaf pages must already have
    /// been removed and accounted by the address space layer.
    pub fn destroy(&mut self, mem: &mut MemoryPool) {
        let l1_frame = match self.l1_frame.take() {
            Some(f) => f,
            None => return,
        };
        {
            let l1 = unsafe { l1_ref(mem, l1_frame) };
            for i in 0..L1_ENTRIES {
                let entry = l1[i];
                if entry & ENTRY_PRESENT != 0 {
                    let pt_pa = entry & !(FRAME_4K - 1);
                    if let Some(idx) = mem_frame(mem, pt_pa) {
                        l1[i] = 0;
                        mem.free(idx);
                    }
                }
            }
        }
        mem.free(l1_frame);
    }

    fn l1_index(va: VAddr) -> usize {
        (va as usize) >> 20
    }

    fn l2_index(va: VAddr) -> usize {
        ((va as usize) >> 12).get_bits(0..8)
    }

    /// Whether the second-level table for `va`'s 1 MiB span exists.
    pub fn is_table_present(&self, mem: &MemoryPool, va: VAddr) -> bool {
        let l1_frame = match self.l1_frame {
            Some(f) => f,
            None => return false,
        };
        let l1 = unsafe { l1_ref(mem, l1_frame) };
        l1[Self::l1_index(va)] & ENTRY_PRESENT != 0
    }

    pub fn is_page_present(&self, mem: &MemoryPool, va: VAddr) -> bool {
        self.extract(mem, va).is_some()
    }

    fn l2_for(&self, mem: &MemoryPool, va: VAddr) -> Option<*mut L2Table> {
        let l1_frame = self.l1_frame?;
        let l1 = unsafe { l1_ref(mem, l1_frame) };
        let entry = l1[Self::l1_index(va)];
        if entry & ENTRY_PRESENT == 0 {
            return None;
        }
        Some(phys_to_kva(entry & !(FRAME_4K - 1)) as *mut L2Table)
    }

    /// Insert a leaf mapping `va -> pa`. The second-level table is
    /// allocated on first use in its span. Fails if a mapping is already
    /// present; callers replace mappings with `remove` + `enter`.
    pub fn enter(
        &mut self, mem: &mut MemoryPool, va: VAddr, pa: PAddr, flags: PageFlags,
    ) -> Result<(), SysError> {
        debug_assert_eq!(va as usize % PAGE_SIZE, 0);
        debug_assert_eq!(pa % PAGE_SIZE, 0);
        let l1_frame = self.l1_frame.ok_or(SysError::Memory)?;

        let l2 = match self.l2_for(mem, va) {
            Some(l2) => l2,
            None => {
                let idx = mem
                    .alloc_zeroed(core::mem::size_of::<L2Table>())
                    .ok_or(SysError::Resource)?;
                mem.frame_mut(idx).pt_span = Some(Self::l1_index(va) as u32);
                let pt_pa = mem.pa(idx);
                let l1 = unsafe { l1_ref(mem, l1_frame) };
                l1[Self::l1_index(va)] = pt_pa | ENTRY_PRESENT;
                phys_to_kva(pt_pa) as *mut L2Table
            },
        };

        let i = Self::l2_index(va);
        unsafe {
            if (*l2).hw[i] & ENTRY_PRESENT != 0 {
                return Err(SysError::Memory);
            }
            (*l2).hw[i] = hw_descriptor(pa, flags);
            (*l2).flags[i] = flags.bits();
        }
        Ok(())
    }

    /// Clear a leaf mapping, returning what was mapped.
    pub fn remove(&mut self, mem: &mut MemoryPool, va: VAddr) -> Result<(PAddr, PageFlags), SysError> {
        let l2 = self.l2_for(mem, va).ok_or(SysError::Memory)?;
        let i = Self::l2_index(va);
        unsafe {
            let entry = (*l2).hw[i];
            if entry & ENTRY_PRESENT == 0 {
                return Err(SysError::Memory);
            }
            let pa = entry & !(PAGE_SIZE - 1);
            let flags = PageFlags::from_bits_truncate((*l2).flags[i]);
            (*l2).hw[i] = 0;
            (*l2).flags[i] = 0;
            Ok((pa, flags))
        }
    }

    /// Look up a present mapping.
    pub fn extract(&self, mem: &MemoryPool, va: VAddr) -> Option<(PAddr, PageFlags)> {
        let l2 = self.l2_for(mem, va)?;
        let i = Self::l2_index(va);
        unsafe {
            let entry = (*l2).hw[i];
            if entry & ENTRY_PRESENT == 0 {
                return None;
            }
            let pa = entry & !(PAGE_SIZE - 1);
            let flags = PageFlags::from_bits_truncate((*l2).flags[i]);
            Some((pa, flags))
        }
    }

    /// Replace the permission and COW bits of a present mapping, keeping
    /// the physical address and the memory-type accounting bits.
    pub fn protect(
        &mut self, mem: &MemoryPool, va: VAddr, flags: PageFlags,
    ) -> Result<(), SysError> {
        let l2 = self.l2_for(mem, va).ok_or(SysError::Memory)?;
        let i = Self::l2_index(va);
        unsafe {
            let entry = (*l2).hw[i];
            if entry & ENTRY_PRESENT == 0 {
                return Err(SysError::Memory);
            }
            let pa = entry & !(PAGE_SIZE - 1);
            let keep = (*l2).flags[i] & PageFlags::MEM_MASK;
            let change =
                flags.bits() & (PageFlags::PROT_MASK | PageFlags::MAP_COW.bits() | 0x0f00);
            (*l2).flags[i] = keep | change;
            (*l2).hw[i] = hw_descriptor(pa, PageFlags::from_bits_truncate(keep | change));
        }
        Ok(())
    }
}

/// Compute the descriptor word the MMU sees.
///
/// On ARM this is the ARMv6 extended small page format: AP bits grant
/// user access, with AP[2] forcing read-only for COW or non-writable
/// pages, and TEX/C/B derived from the cache policy. Elsewhere (host
/// tests) a present bit over the address suffices.
fn hw_descriptor(pa: PAddr, flags: PageFlags) -> usize {
    #[cfg(all(target_arch = "arm", not(test)))]
    {
        let mut desc = pa & !(PAGE_SIZE - 1);
        desc |= 0b10; // extended small page
        desc |= 0b11 << 4; // AP[1:0]: user + kernel access
        if !flags.writable() || flags.cow() {
            desc |= 1 << 9; // AP[2]: read-only
        }
        if !flags.contains(PageFlags::PROT_EXEC) {
            desc |= 1; // XN
        }
        if !flags.contains(PageFlags::CACHE_UNCACHEABLE) {
            desc |= 0b11 << 2; // C + B: write-back cacheable
        }
        desc
    }
    #[cfg(not(all(target_arch = "arm", not(test))))]
    {
        let _ = flags;
        (pa & !(PAGE_SIZE - 1)) | ENTRY_PRESENT
    }
}

unsafe fn l1_ref(mem: &MemoryPool, frame: usize) -> &'static mut L1Table {
    &mut *(phys_to_kva(mem.pa(frame)) as *mut L1Table)
}

fn mem_frame(mem: &MemoryPool, pa: PAddr) -> Option<usize> {
    mem.frame_index(pa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pageframe::FRAME_64K;

    fn setup() -> (MemoryPool, Pmap) {
        let mut mem = MemoryPool::with_test_arena(64 * FRAME_64K);
        let mut pmap = Pmap::new();
        pmap.create(&mut mem).unwrap();
        (mem, pmap)
    }

    #[test]
    fn enter_extract_remove() {
        let (mut mem, mut pmap) = setup();
        let frame = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        let pa = mem.pa(frame);
        let flags = PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC;

        let va: VAddr = 0x0100_0000;
        pmap.enter(&mut mem, va, pa, flags).unwrap();
        assert!(pmap.is_page_present(&mem, va));
        assert!(!pmap.is_page_present(&mem, va + PAGE_SIZE as u32));

        let (got_pa, got_flags) = pmap.extract(&mem, va).unwrap();
        assert_eq!(got_pa, pa);
        assert_eq!(got_flags, flags);

        let (rem_pa, _) = pmap.remove(&mut mem, va).unwrap();
        assert_eq!(rem_pa, pa);
        assert!(!pmap.is_page_present(&mem, va));
        assert!(pmap.remove(&mut mem, va).is_err());
    }

    #[test]
    fn l2_tables_allocate_lazily_per_span() {
        let (mut mem, mut pmap) = setup();
        let before = mem.in_use_pages_4k();

        let frame = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        let pa = mem.pa(frame);
        let flags = PageFlags::PROT_READ | PageFlags::MEM_ALLOC;

        assert!(!pmap.is_table_present(&mem, 0x0100_0000));
        pmap.enter(&mut mem, 0x0100_0000, pa, flags).unwrap();
        assert!(pmap.is_table_present(&mem, 0x0100_0000));
        // Second page in the same span shares the table.
        let frame2 = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        let pa2 = mem.pa(frame2);
        pmap.enter(&mut mem, 0x0100_1000, pa2, flags).unwrap();

        // frame + frame2 + one L2 table
        assert_eq!(mem.in_use_pages_4k(), before + 3);
    }

    #[test]
    fn protect_changes_permissions_only() {
        let (mut mem, mut pmap) = setup();
        let frame = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        let pa = mem.pa(frame);
        let va: VAddr = 0x0200_0000;

        pmap.enter(
            &mut mem,
            va,
            pa,
            PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC,
        )
        .unwrap();

        pmap.protect(&mem, va, PageFlags::PROT_READ).unwrap();
        let (got_pa, flags) = pmap.extract(&mem, va).unwrap();
        assert_eq!(got_pa, pa);
        assert!(flags.is_alloc());
        assert!(!flags.writable());

        pmap.protect(&mem, va, PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MAP_COW)
            .unwrap();
        let (_, flags) = pmap.extract(&mem, va).unwrap();
        assert!(flags.cow());
        assert!(flags.is_alloc());
    }

    #[test]
    fn destroy_releases_table_frames() {
        let (mut mem, mut pmap) = setup();
        let baseline = mem.in_use_pages_4k();

        let frame = mem.alloc_zeroed(PAGE_SIZE).unwrap();
        let pa = mem.pa(frame);
        pmap.enter(&mut mem, 0x0300_0000, pa, PageFlags::PROT_READ | PageFlags::MEM_ALLOC)
            .unwrap();
        pmap.remove(&mut mem, 0x0300_0000).unwrap();
        mem.free(frame);

        pmap.destroy(&mut mem);
        // L1 + the lazily created L2 are back in the pool.
        assert_eq!(mem.in_use_pages_4k(), 0);
        let _ = baseline;
        assert!(!pmap.is_created());
    }
}
