//! Thin hardware access layer: the boot record, MMIO primitives, barriers
//! and the interrupt-enable discipline. Everything here is a few
//! instructions at most; policy lives in the callers.

pub mod board;

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Filled in by the boot firmware and handed to `kernel_main`. The kernel
/// trusts the contents; validating them is the firmware's job.
#[derive(Debug)]
#[repr(C)]
pub struct BootInfo {
    /// Entry point of the first user process (inside the IFS image).
    pub root_entry: u32,
    /// Top of the first process's user stack.
    pub root_stack_top: u32,

    pub screen_width: u32,
    pub screen_height: u32,
    pub screen_pitch: u32,
    pub screen_buf: u32,

    /// Physical bases of the peripherals the kernel itself drives.
    pub timer_base: usize,
    pub interrupt_base: usize,
    pub gpio_base: usize,
    pub uart_base: usize,

    /// Total RAM handed to the kernel-managed pool.
    pub mem_size: usize,

    /// Initial file system image, mapped into the first process.
    pub ifs_image_base: u32,
    pub ifs_image_size: u32,

    /// Boot command line (`cmdline.txt`), UTF-8.
    pub cmdline_ptr: *const u8,
    pub cmdline_len: usize,
}

unsafe impl Send for BootInfo {}
unsafe impl Sync for BootInfo {}

impl BootInfo {
    pub fn cmdline(&self) -> &str {
        if self.cmdline_ptr.is_null() || self.cmdline_len == 0 {
            return "";
        }
        let bytes = unsafe { core::slice::from_raw_parts(self.cmdline_ptr, self.cmdline_len) };
        core::str::from_utf8(bytes).unwrap_or("")
    }
}

/// Peripheral bases, recorded once at boot for the interrupt and timer
/// paths which run before any `KERNEL` lock is taken.
pub static TIMER_BASE: AtomicUsize = AtomicUsize::new(0);
pub static INTERRUPT_BASE: AtomicUsize = AtomicUsize::new(0);
pub static GPIO_BASE: AtomicUsize = AtomicUsize::new(0);
pub static UART_BASE: AtomicUsize = AtomicUsize::new(0);

pub unsafe fn init(bootinfo: &BootInfo) {
    TIMER_BASE.store(bootinfo.timer_base, Ordering::Relaxed);
    INTERRUPT_BASE.store(bootinfo.interrupt_base, Ordering::Relaxed);
    GPIO_BASE.store(bootinfo.gpio_base, Ordering::Relaxed);
    UART_BASE.store(bootinfo.uart_base, Ordering::Relaxed);
}

/// Raw MMIO access. Register structs in `board` are the preferred
/// interface; these exist for one-off accesses.
pub unsafe fn mmio_read(addr: usize) -> u32 {
    core::ptr::read_volatile(addr as *const u32)
}

pub unsafe fn mmio_write(addr: usize, value: u32) {
    core::ptr::write_volatile(addr as *mut u32, value);
}

/// Data memory barrier. Required between accesses to different BCM283x
/// peripherals.
#[inline(always)]
pub fn memory_barrier() {
    #[cfg(target_arch = "arm")]
    unsafe {
        core::arch::asm!("mcr p15, 0, {t}, c7, c10, 5", t = in(reg) 0u32, options(nostack));
    }
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Strictly nested CPU interrupt masking. Depth 0 means IRQs enabled.
static INTERRUPT_DEPTH: AtomicI32 = AtomicI32::new(1); // boot runs with IRQs off

pub unsafe fn disable_interrupts() {
    cpu_irq_off();
    INTERRUPT_DEPTH.fetch_add(1, Ordering::Relaxed);
}

pub unsafe fn enable_interrupts() {
    let depth = INTERRUPT_DEPTH.fetch_sub(1, Ordering::Relaxed) - 1;
    debug_assert!(depth >= 0, "unbalanced enable_interrupts");
    if depth == 0 {
        cpu_irq_on();
    }
}

/// Unconditionally mask IRQs at the CPU; used on the panic path only.
pub unsafe fn interrupts_off() {
    INTERRUPT_DEPTH.store(1, Ordering::Relaxed);
    cpu_irq_off();
}

unsafe fn cpu_irq_off() {
    #[cfg(target_arch = "arm")]
    core::arch::asm!("cpsid i", options(nostack));
}

unsafe fn cpu_irq_on() {
    #[cfg(target_arch = "arm")]
    core::arch::asm!("cpsie i", options(nostack));
}

pub unsafe fn wait_for_interrupt() {
    #[cfg(target_arch = "arm")]
    core::arch::asm!("wfi", options(nostack));
    #[cfg(not(target_arch = "arm"))]
    core::hint::spin_loop();
}

/// Used by the self-test build to stop QEMU. Real boards just hang.
pub fn power_off() -> ! {
    log::info!("Halting.");
    loop {
        unsafe { wait_for_interrupt() }
    }
}
