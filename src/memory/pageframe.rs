//! Physical page pool.
//!
//! Pages come in three sizes: 4 KiB, 16 KiB and 64 KiB. Every 64 KiB slab
//! is naturally aligned and subdivides exactly into four 16 KiB or sixteen
//! 4 KiB frames, indexed contiguously in the frame table. Allocation
//! prefers the smallest class that fits and splits a larger slab when a
//! class runs dry; freeing a small frame re-forms the enclosing 64 KiB
//! slab as soon as every constituent is free again.

use alloc::vec::Vec;

use super::{phys_to_kva, PAddr, PAGE_SIZE};

pub const FRAME_4K: usize = 4096;
pub const FRAME_16K: usize = 16384;
pub const FRAME_64K: usize = 65536;

/// 4 KiB granules per 64 KiB slab.
const SLAB_GRANULES: usize = FRAME_64K / FRAME_4K;

/// Descriptor of one physical frame. A frame record is meaningful only
/// when it heads a block (free or in use); interior granules of a larger
/// block are dormant.
#[derive(Debug)]
pub struct Pageframe {
    /// Block size in bytes: 4096, 16384 or 65536.
    pub size: usize,
    pub in_use: bool,
    /// Sharers of this frame (copy-on-write parents and children).
    pub reference_cnt: u32,
    /// When the frame holds a page table: the L1 span it backs.
    pub pt_span: Option<u32>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Pageframe {
    fn new(size: usize) -> Self {
        Pageframe {
            size,
            in_use: false,
            reference_cnt: 0,
            pt_span: None,
            prev: None,
            next: None,
        }
    }
}

/// Intrusive doubly-linked list through the frame table, so unlinking an
/// arbitrary frame during coalescing is O(1).
#[derive(Debug, Default)]
struct FreeList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl FreeList {
    fn push_tail(&mut self, frames: &mut [Pageframe], idx: usize) {
        frames[idx].prev = self.tail;
        frames[idx].next = None;
        match self.tail {
            Some(t) => frames[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    fn push_head(&mut self, frames: &mut [Pageframe], idx: usize) {
        frames[idx].prev = None;
        frames[idx].next = self.head;
        match self.head {
            Some(h) => frames[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    fn pop_head(&mut self, frames: &mut [Pageframe]) -> Option<usize> {
        let idx = self.head?;
        self.unlink(frames, idx);
        Some(idx)
    }

    fn unlink(&mut self, frames: &mut [Pageframe], idx: usize) {
        let (prev, next) = (frames[idx].prev, frames[idx].next);
        match prev {
            Some(p) => frames[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => frames[n].prev = prev,
            None => self.tail = prev,
        }
        frames[idx].prev = None;
        frames[idx].next = None;
        self.len -= 1;
    }
}

#[derive(Debug)]
pub struct MemoryPool {
    base: PAddr,
    frames: Vec<Pageframe>,
    free_4k: FreeList,
    free_16k: FreeList,
    free_64k: FreeList,
    #[cfg(test)]
    _arena: Option<TestArena>,
}

impl MemoryPool {
    /// Build the pool over `[base, base + size)`. `base` must be 64 KiB
    /// aligned; a partial trailing slab is ignored.
    pub fn new(base: PAddr, size: usize) -> Self {
        assert_eq!(base % FRAME_64K, 0, "pool base must be slab aligned");
        let slabs = size / FRAME_64K;
        let granules = slabs * SLAB_GRANULES;

        let mut frames = Vec::with_capacity(granules);
        for i in 0..granules {
            let size = if i % SLAB_GRANULES == 0 { FRAME_64K } else { FRAME_4K };
            frames.push(Pageframe::new(size));
        }

        let mut pool = MemoryPool {
            base,
            frames,
            free_4k: FreeList::default(),
            free_16k: FreeList::default(),
            free_64k: FreeList::default(),
            #[cfg(test)]
            _arena: None,
        };
        for slab in 0..slabs {
            let frames = &mut pool.frames;
            pool.free_64k.push_tail(frames, slab * SLAB_GRANULES);
        }
        pool
    }

    /// Host-test pool over freshly allocated, slab-aligned process memory.
    /// "Physical" addresses are real pointers into the arena, so page
    /// contents can be read and written by tests.
    #[cfg(test)]
    pub fn with_test_arena(size: usize) -> Self {
        let arena = TestArena::new(size);
        let mut pool = MemoryPool::new(arena.base(), size);
        pool._arena = Some(arena);
        pool
    }

    pub fn frame(&self, idx: usize) -> &Pageframe {
        &self.frames[idx]
    }

    pub fn frame_mut(&mut self, idx: usize) -> &mut Pageframe {
        &mut self.frames[idx]
    }

    pub fn pa(&self, idx: usize) -> PAddr {
        self.base + idx * FRAME_4K
    }

    /// Frame index of a pool physical address, or `None` if outside the
    /// managed range.
    pub fn frame_index(&self, pa: PAddr) -> Option<usize> {
        if pa < self.base || pa % FRAME_4K != 0 {
            return None;
        }
        let idx = (pa - self.base) / FRAME_4K;
        if idx < self.frames.len() {
            Some(idx)
        } else {
            None
        }
    }

    fn class_of(size: usize) -> Option<usize> {
        match size {
            0 => None,
            s if s <= FRAME_4K => Some(FRAME_4K),
            s if s <= FRAME_16K => Some(FRAME_16K),
            s if s <= FRAME_64K => Some(FRAME_64K),
            _ => None,
        }
    }

    /// Allocate a frame of at least `size` bytes. Returns the frame index.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let class = Self::class_of(size)?;
        let idx = match class {
            FRAME_4K => self.take_4k(),
            FRAME_16K => self.take_16k(),
            _ => self.free_64k.pop_head(&mut self.frames),
        }?;

        let frame = &mut self.frames[idx];
        frame.size = class;
        frame.in_use = true;
        frame.reference_cnt = 0;
        frame.pt_span = None;
        Some(idx)
    }

    pub fn alloc_zeroed(&mut self, size: usize) -> Option<usize> {
        let idx = self.alloc(size)?;
        let frame_size = self.frames[idx].size;
        unsafe {
            core::ptr::write_bytes(phys_to_kva(self.pa(idx)), 0, frame_size);
        }
        Some(idx)
    }

    fn take_4k(&mut self) -> Option<usize> {
        if let Some(idx) = self.free_4k.pop_head(&mut self.frames) {
            return Some(idx);
        }
        // Promote from the next class up, pushing the remainder back.
        if let Some(idx) = self.free_16k.pop_head(&mut self.frames) {
            for t in (1..4).rev() {
                self.frames[idx + t].size = FRAME_4K;
                self.frames[idx + t].in_use = false;
                self.free_4k.push_head(&mut self.frames, idx + t);
            }
            return Some(idx);
        }
        if let Some(idx) = self.free_64k.pop_head(&mut self.frames) {
            for t in (1..SLAB_GRANULES).rev() {
                self.frames[idx + t].size = FRAME_4K;
                self.frames[idx + t].in_use = false;
                self.free_4k.push_head(&mut self.frames, idx + t);
            }
            return Some(idx);
        }
        None
    }

    fn take_16k(&mut self) -> Option<usize> {
        if let Some(idx) = self.free_16k.pop_head(&mut self.frames) {
            return Some(idx);
        }
        if let Some(idx) = self.free_64k.pop_head(&mut self.frames) {
            for t in (1..4).rev() {
                let sub = idx + t * (FRAME_16K / FRAME_4K);
                self.frames[sub].size = FRAME_16K;
                self.frames[sub].in_use = false;
                self.free_16k.push_head(&mut self.frames, sub);
            }
            return Some(idx);
        }
        None
    }

    /// Return a frame to its free list and coalesce the enclosing 64 KiB
    /// slab if every constituent block is now free. Bounded at O(16).
    pub fn free(&mut self, idx: usize) {
        let frame = &mut self.frames[idx];
        assert!(frame.in_use, "double free of frame {}", idx);
        assert_eq!(frame.reference_cnt, 0, "freeing referenced frame {}", idx);
        frame.in_use = false;
        frame.pt_span = None;

        match frame.size {
            FRAME_64K => {
                self.free_64k.push_tail(&mut self.frames, idx);
                return;
            },
            FRAME_16K => self.free_16k.push_tail(&mut self.frames, idx),
            _ => self.free_4k.push_tail(&mut self.frames, idx),
        }

        // Walk the block heads tiling the enclosing slab.
        let slab_base = idx - (idx % SLAB_GRANULES);
        let mut t = slab_base;
        while t < slab_base + SLAB_GRANULES {
            let f = &self.frames[t];
            if f.in_use {
                return;
            }
            t += f.size / FRAME_4K;
        }

        // Fully free: collapse back into one 64 KiB slab.
        let mut t = slab_base;
        while t < slab_base + SLAB_GRANULES {
            let size = self.frames[t].size;
            match size {
                FRAME_16K => self.free_16k.unlink(&mut self.frames, t),
                _ => self.free_4k.unlink(&mut self.frames, t),
            }
            t += size / FRAME_4K;
        }
        self.frames[slab_base].size = FRAME_64K;
        self.free_64k.push_tail(&mut self.frames, slab_base);
    }

    /// Free pages expressed in 4 KiB units; with `in_use_pages_4k` this is
    /// conserved across any alloc/free sequence.
    pub fn free_pages_4k(&self) -> usize {
        self.free_4k.len + 4 * self.free_16k.len + 16 * self.free_64k.len
    }

    pub fn in_use_pages_4k(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.in_use)
            .map(|f| f.size / PAGE_SIZE)
            .sum()
    }

    pub fn total_pages_4k(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
#[derive(Debug)]
struct TestArena {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

#[cfg(test)]
unsafe impl Send for TestArena {}

#[cfg(test)]
impl TestArena {
    fn new(size: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(size, FRAME_64K).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        TestArena { ptr, layout }
    }

    fn base(&self) -> PAddr {
        self.ptr as PAddr
    }
}

#[cfg(test)]
impl Drop for TestArena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}
