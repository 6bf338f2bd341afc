//! Memory management: physical page pool, per-process page tables,
//! address spaces and the fault path.

pub mod addrspace;
pub mod pageframe;
pub mod pagefault;
pub mod pmap;
pub mod uaccess;
pub mod vm;

pub use self::pagefault::handle_fault;

/// A user virtual address. The user window is a 32-bit space on both
/// supported boards.
pub type VAddr = u32;

/// A physical address as wide as a kernel pointer, since the kernel
/// accesses physical memory through its identity window.
pub type PAddr = usize;

pub const PAGE_SIZE: usize = 4096;

/// User-mode virtual range. Everything below `VM_USER_BASE` traps (null
/// pages), everything from `KERNEL_BASE` up is the kernel window.
pub const VM_USER_BASE: VAddr = 0x0080_0000;
pub const VM_USER_CEILING: VAddr = 0x7F00_0000;

/// Kernel virtual window: physical memory mapped 1:1 at this offset.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// Kernel heap window (virtual), backed by the low reserved megabytes.
pub const KERNEL_HEAP_BASE: usize = KERNEL_BASE + 0x0040_0000;
pub const KERNEL_HEAP_CEILING: usize = KERNEL_BASE + 0x0080_0000;

/// Physical memory below this is the kernel image, heap and IFS staging
/// area; the pageframe pool manages everything above it.
pub const KERNEL_RESERVED_PHYS: usize = 0x0080_0000;

bitflags! {
    /// Per-page mapping flags, stored in the pmap shadow word.
    ///
    /// The low bits mirror the userspace `MapFlags` protection encoding;
    /// the high field records how the page is accounted.
    pub struct PageFlags: u32 {
        const PROT_READ  = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXEC  = 1 << 2;

        const CACHE_WRITEBACK    = 1 << 8;
        const CACHE_WRITETHRU    = 2 << 8;
        const CACHE_WRITECOMBINE = 3 << 8;
        const CACHE_UNCACHEABLE  = 4 << 8;

        /// Shared copy-on-write page; write access traps and duplicates.
        const MAP_COW = 1 << 24;

        /// Page is a reference-counted allocation from the pageframe pool.
        const MEM_ALLOC = 2 << 29;
        /// Raw physical mapping (device memory, framebuffer); unaccounted.
        const MEM_PHYS = 3 << 29;
    }
}

impl PageFlags {
    pub const MEM_MASK: u32 = 0xE000_0000;
    pub const PROT_MASK: u32 = 0x0000_0007;

    pub fn mem_type(self) -> u32 {
        self.bits() & Self::MEM_MASK
    }

    pub fn is_alloc(self) -> bool {
        self.mem_type() == PageFlags::MEM_ALLOC.bits()
    }

    pub fn is_phys(self) -> bool {
        self.mem_type() == PageFlags::MEM_PHYS.bits()
    }

    pub fn writable(self) -> bool {
        self.contains(PageFlags::PROT_WRITE)
    }

    pub fn cow(self) -> bool {
        self.contains(PageFlags::MAP_COW)
    }
}

/// Translate a pool physical address to a kernel-dereferencable pointer.
///
/// On the target the kernel window maps physical memory at `KERNEL_BASE`.
/// In host test builds the "physical" pool is plain process memory, so the
/// translation is the identity.
#[inline]
pub fn phys_to_kva(pa: PAddr) -> *mut u8 {
    #[cfg(all(target_arch = "arm", not(test)))]
    {
        (KERNEL_BASE + pa) as *mut u8
    }
    #[cfg(not(all(target_arch = "arm", not(test))))]
    {
        pa as *mut u8
    }
}

/// Kernel heap is a fixed window owned by the global bump allocator;
/// nothing to hand over, but the boot log records the sizing.
pub unsafe fn init_heap(bootinfo: &crate::hal::BootInfo) {
    log::debug!(
        "heap window {:#x}..{:#x}, ram {} MiB",
        KERNEL_HEAP_BASE,
        KERNEL_HEAP_CEILING,
        bootinfo.mem_size / (1024 * 1024)
    );
}

pub fn page_align_down(addr: VAddr) -> VAddr {
    addr & !(PAGE_SIZE as u32 - 1)
}

pub fn page_align_up(addr: VAddr) -> VAddr {
    page_align_down(addr.wrapping_add(PAGE_SIZE as u32 - 1))
}
