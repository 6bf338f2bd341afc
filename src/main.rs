// Safety
#![deny(overflowing_literals)]
#![deny(unused_must_use)]
// Code style (development time)
#![allow(unused_macros)]
#![allow(dead_code)]
// Disable some clippy lints
#![allow(clippy::identity_op)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::new_without_default)]
#![allow(clippy::unreadable_literal)]
// No stdlib or mainfn when not running tests
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
// Unstable features
#![cfg_attr(not(test), feature(alloc_error_handler))]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate alloc;

// Utilities
mod util;

// Hardware access
mod arch;
mod driver;
mod hal;

// Everything else
mod cfg;
mod interrupt;
mod ipc;
mod kernel;
mod memory;
mod multitasking;
mod syscall;
mod syslog;
mod time;

use self::kernel::KERNEL;

/// The kernel main function, called by the arch boot path with the boot
/// record the firmware filled in.
#[no_mangle]
pub extern "C" fn kernel_main(bootinfo: &'static hal::BootInfo) -> ! {
    driver::uart::init(bootinfo);
    syslog::enable();

    let options = cfg::parse(bootinfo.cmdline());
    syslog::set_level(options.verbose);

    log::info!("Initializing the system...");

    unsafe {
        memory::init_heap(bootinfo);
        hal::init(bootinfo);
        interrupt::init_controller();
        time::init_hardware_timer();
    }

    {
        let mut kernel = KERNEL.lock();
        kernel::init(&mut kernel, bootinfo, &options);
    }

    log::info!("Kernel initialized.");

    #[cfg(feature = "self-test")]
    {
        log::info!("Self-test successful");
        hal::power_off();
    }

    // Hand the CPU to the first process. Never returns: every later entry
    // to the kernel comes through the exception vectors.
    unsafe { arch::enter_first_process() }
}

#[cfg(not(test))]
#[global_allocator]
static HEAP_ALLOCATOR: pionalloc::GlobAlloc = pionalloc::GlobAlloc::new(
    pionalloc::BumpAllocator::new(memory::KERNEL_HEAP_BASE, memory::KERNEL_HEAP_CEILING),
);

#[cfg(not(test))]
#[alloc_error_handler]
fn out_of_memory(layout: core::alloc::Layout) -> ! {
    panic!("Kernel heap exhausted (allocating {:?})", layout);
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    unsafe {
        hal::interrupts_off();
    }
    syslog::panic_dump(info);
    loop {
        unsafe { hal::wait_for_interrupt() }
    }
}
