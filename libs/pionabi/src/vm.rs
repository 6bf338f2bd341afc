//! Virtual memory ABI: the flag word accepted by the `virtualalloc` family.
//!
//! Only the bits below are meaningful to userspace. The kernel masks out
//! everything else before use, so stray bits are harmless.

bitflags! {
    /// Protection and cache-policy bits for `virtualalloc`,
    /// `virtualallocphys` and `virtualprotect`.
    pub struct MapFlags: u32 {
        const PROT_READ  = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXEC  = 1 << 2;

        /// Place the mapping exactly at the requested address.
        const MAP_FIXED = 1 << 3;

        // Cache policy occupies bits 8..12 as a small enum, not a bitmask.
        const CACHE_WRITEBACK     = 1 << 8;
        const CACHE_WRITETHRU     = 2 << 8;
        const CACHE_WRITECOMBINE  = 3 << 8;
        const CACHE_UNCACHEABLE   = 4 << 8;
    }
}

impl MapFlags {
    pub const PROT_MASK: u32 = 0x0000_0007;
    pub const CACHE_MASK: u32 = 0x0000_0f00;

    pub fn readable(self) -> bool {
        self.contains(MapFlags::PROT_READ)
    }

    pub fn writable(self) -> bool {
        self.contains(MapFlags::PROT_WRITE)
    }

    pub fn executable(self) -> bool {
        self.contains(MapFlags::PROT_EXEC)
    }
}

/// Page size shared with userspace allocators.
pub const PAGE_SIZE: usize = 4096;
