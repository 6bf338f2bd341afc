//! The kernel-global state, held as one value behind one lock.
//!
//! This kernel is non-preemptible with a single kernel stack; holding
//! `KERNEL` *is* the big kernel lock. Interrupt top halves never take
//! it; they talk to the bottom halves through the latch statics in the
//! `time` and `interrupt` modules.

use hashbrown::HashMap;
use spin::Mutex;

use pionabi::process::ProcFlags;
use pionabi::SysError;

use crate::arch::TaskState;
use crate::cfg::BootOptions;
use crate::hal::BootInfo;
use crate::interrupt::IsrTable;
use crate::ipc::{Channel, Msg, MsgPort, Notification};
use crate::memory::addrspace::SegType;
use crate::memory::pageframe::MemoryPool;
use crate::memory::{PageFlags, KERNEL_RESERVED_PHYS, PAGE_SIZE, VM_USER_BASE};
use crate::multitasking::process::{KernelTask, ProcState, Process, ProcessId, SCHED_IDLE};
use crate::multitasking::{HandleObject, HandleTable, HandleType, Rendez, Scheduler};
use crate::time::TimerWheel;
use crate::util::slab::Slab;

/// Kernel-internal error: either a real error code for the caller, or
/// the marker that the caller went to sleep and the syscall must restart
/// from the top after wakeup. `Restart` never reaches user mode as a
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KErr {
    Sys(SysError),
    Restart,
}

impl From<SysError> for KErr {
    fn from(e: SysError) -> Self {
        KErr::Sys(e)
    }
}

pub type KResult<T> = Result<T, KErr>;

/// Boot-time sizes of the fixed kernel tables.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_process: usize,
    pub max_handle: usize,
    pub max_timer: usize,
    pub max_channel: usize,
    pub max_notification: usize,
    pub max_isr_handler: usize,
    pub max_rendez: usize,
    pub max_msgport: usize,
    pub max_msg: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_process: 64,
            max_handle: 512,
            max_timer: 128,
            max_channel: 128,
            max_notification: 64,
            max_isr_handler: 64,
            max_rendez: 1024,
            max_msgport: 64,
            max_msg: 256,
        }
    }
}

pub struct Kernel {
    pub limits: Limits,
    pub mem: MemoryPool,

    pub procs: HashMap<ProcessId, Process>,
    pub next_pid: ProcessId,
    pub root: Option<ProcessId>,

    pub handles: HandleTable,
    pub rendezvous: Slab<Rendez>,
    pub sched: Scheduler,
    pub wheel: TimerWheel,

    pub channels: Slab<Channel>,
    pub notifications: Slab<Notification>,
    pub msgports: Slab<MsgPort>,
    pub msgs: Slab<Msg>,

    pub isr: IsrTable,

    pub reschedule_request: bool,
}

impl Kernel {
    pub fn new(mem: MemoryPool, limits: Limits) -> Self {
        let mut kernel = Kernel {
            mem,
            procs: HashMap::new(),
            next_pid: ProcessId::first(),
            root: None,
            handles: HandleTable::new(limits.max_handle),
            rendezvous: Slab::with_capacity(limits.max_rendez),
            sched: Scheduler::new(ProcessId::first()),
            wheel: TimerWheel::new(limits.max_timer),
            channels: Slab::with_capacity(limits.max_channel),
            notifications: Slab::with_capacity(limits.max_notification),
            msgports: Slab::with_capacity(limits.max_msgport),
            msgs: Slab::with_capacity(limits.max_msg),
            isr: IsrTable::new(limits.max_isr_handler),
            reschedule_request: false,
            limits,
        };

        // The idle process: never on a ready queue, picked only when
        // nothing else is runnable, restarted from scratch on every
        // preemption.
        let idle = kernel
            .alloc_process(SCHED_IDLE, 0)
            .expect("fresh tables cannot be full");
        {
            let proc = kernel.procs.get_mut(&idle).expect("idle vanished");
            proc.state = ProcState::Running;
            proc.flags = ProcFlags::DAEMON;
            proc.continuation = Some(KernelTask::Idle);
        }
        kernel.sched.current = idle;
        kernel.sched.idle = idle;
        kernel
    }

    pub fn current(&self) -> ProcessId {
        self.sched.current
    }

    pub fn cur(&mut self) -> &mut Process {
        let pid = self.sched.current;
        self.procs.get_mut(&pid).expect("current process missing")
    }

    pub fn cur_ref(&self) -> &Process {
        let pid = self.sched.current;
        self.procs.get(&pid).expect("current process missing")
    }

    /// Create the first user process from the boot record: IFS image
    /// mapped at the bottom of the user range, a stack under
    /// `stack_top`, allow-io privilege, and the exit handle looping back
    /// to itself (nobody else will ever join it).
    pub fn create_root(
        &mut self, entry: u32, stack_top: u32, ifs: Option<(usize, usize)>, tickets: i32,
    ) -> Result<ProcessId, SysError> {
        let h = self.handles.alloc().ok_or(SysError::Resource)?;
        let pid = match self.alloc_process(pionabi::process::SCHED_OTHER, tickets) {
            Ok(pid) => pid,
            Err(e) => {
                self.free_handle(h);
                return Err(e);
            },
        };

        {
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&pid).expect("root vanished");
            proc.pmap.create(mem)?;
            proc.task_state = TaskState::new_user(entry, stack_top);
            proc.flags = ProcFlags::ALLOW_IO;
            proc.handle = h;
        }

        if let Some((ifs_base, ifs_size)) = ifs {
            self.map_root_image(pid, ifs_base, ifs_size)?;
        }
        if stack_top != 0 {
            self.map_root_stack(pid, stack_top)?;
        }

        self.handles
            .set_object(pid, h, HandleType::Process, HandleObject::Process(pid));
        self.root = Some(pid);

        self.procs.get_mut(&pid).expect("root vanished").state = ProcState::Ready;
        self.sched_ready(pid);
        log::info!("root process {} entry {:#x}", pid, entry);
        Ok(pid)
    }

    /// The IFS image stays where the firmware loaded it; the root
    /// process sees it read-execute at the bottom of its range.
    fn map_root_image(&mut self, pid: ProcessId, base: usize, size: usize) -> Result<(), SysError> {
        let flags = PageFlags::PROT_READ | PageFlags::PROT_EXEC | PageFlags::MEM_PHYS;
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get_mut(&pid).expect("root vanished");
        proc.aspace
            .reserve(Some(VM_USER_BASE), (pages * PAGE_SIZE) as u32, SegType::Phys)?;
        for i in 0..pages {
            let va = VM_USER_BASE + (i * PAGE_SIZE) as u32;
            proc.pmap.enter(mem, va, base + i * PAGE_SIZE, flags)?;
        }
        Ok(())
    }

    /// 64 KiB of stack ending at `stack_top`.
    fn map_root_stack(&mut self, pid: ProcessId, stack_top: u32) -> Result<(), SysError> {
        const STACK_SIZE: u32 = 0x10000;
        let base = stack_top - STACK_SIZE;
        let flags = PageFlags::PROT_READ | PageFlags::PROT_WRITE | PageFlags::MEM_ALLOC;
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get_mut(&pid).expect("root vanished");
        proc.aspace.reserve(Some(base), STACK_SIZE, SegType::Alloc)?;
        let mut va = base;
        while va < stack_top {
            let idx = mem.alloc_zeroed(PAGE_SIZE).ok_or(SysError::Memory)?;
            let pa = mem.pa(idx);
            proc.pmap.enter(mem, va, pa, flags)?;
            mem.frame_mut(idx).reference_cnt = 1;
            va += PAGE_SIZE as u32;
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    /// The big kernel lock and everything it protects.
    pub static ref KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new(
        MemoryPool::new(0, 0),
        Limits::default(),
    ));
}

/// Boot-time replacement of the placeholder state with the real pool and
/// the first process.
pub fn init(kernel: &mut Kernel, bootinfo: &BootInfo, options: &BootOptions) {
    let pool_base = KERNEL_RESERVED_PHYS;
    let pool_size = bootinfo.mem_size.saturating_sub(pool_base);
    *kernel = Kernel::new(MemoryPool::new(pool_base, pool_size), Limits::default());

    let ifs = if bootinfo.ifs_image_size > 0 {
        Some((
            bootinfo.ifs_image_base as usize,
            bootinfo.ifs_image_size as usize,
        ))
    } else {
        None
    };
    let root = kernel
        .create_root(
            bootinfo.root_entry,
            bootinfo.root_stack_top,
            ifs,
            options.root_tickets,
        )
        .expect("cannot create the first process");

    kernel.reschedule_request = false;
    kernel.reschedule();
    assert_eq!(kernel.current(), root, "first process not scheduled");
    log::debug!(
        "pool: {} pages free, {} handles, {} processes max",
        kernel.mem.free_pages_4k(),
        kernel.handles.free_count(),
        kernel.limits.max_process
    );
}

#[cfg(test)]
impl Kernel {
    /// A kernel over a host-memory pool with a running, privileged
    /// "root" process as current, mirroring the state right after boot.
    pub fn for_tests() -> Kernel {
        use crate::memory::pageframe::FRAME_64K;
        let mem = MemoryPool::with_test_arena(64 * FRAME_64K);
        let mut kernel = Kernel::new(mem, Limits::default());
        let root = kernel
            .create_root(0x0080_0000, 0, None, 100)
            .expect("test root");
        kernel.reschedule_request = false;
        kernel.reschedule();
        assert_eq!(kernel.current(), root);
        kernel
    }

    /// Simulate a user-mode byte write, faulting COW pages like the MMU
    /// would.
    pub fn poke_user(&mut self, va: crate::memory::VAddr, byte: u8) {
        let current = self.current();
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get_mut(&current).expect("no current");
        let (_, flags) = proc.pmap.extract(mem, crate::memory::page_align_down(va)).expect("poke: unmapped");
        assert!(flags.writable(), "poke: read-only page");
        if flags.cow() {
            crate::memory::pagefault::page_fault(
                mem,
                &mut proc.pmap,
                va,
                PageFlags::PROT_WRITE.bits(),
            )
            .expect("poke: COW service failed");
        }
        let (pa, _) = proc.pmap.extract(mem, crate::memory::page_align_down(va)).expect("poke: unmapped");
        let offset = (va as usize) & (PAGE_SIZE - 1);
        unsafe {
            *crate::memory::phys_to_kva(pa).add(offset) = byte;
        }
    }

    /// Read a byte through the current process's page tables.
    pub fn peek_user(&mut self, va: crate::memory::VAddr) -> u8 {
        let current = self.current();
        self.peek_user_of(current, va)
    }

    pub fn peek_user_of(&mut self, pid: ProcessId, va: crate::memory::VAddr) -> u8 {
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get(&pid).expect("no such process");
        let (pa, _) = proc.pmap.extract(mem, crate::memory::page_align_down(va)).expect("peek: unmapped");
        let offset = (va as usize) & (PAGE_SIZE - 1);
        unsafe { *crate::memory::phys_to_kva(pa).add(offset) }
    }
}
