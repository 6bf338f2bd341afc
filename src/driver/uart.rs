//! Debug UART output.
//!
//! The boot firmware has already configured the pins and baud rate; the
//! kernel only ever transmits. Which UART this is (PL011 on the Pi 1,
//! either on the Pi 4) is decided by the base address in `BootInfo`.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::hal::BootInfo;

static BASE: AtomicUsize = AtomicUsize::new(0);

pub fn init(bootinfo: &BootInfo) {
    BASE.store(bootinfo.uart_base, Ordering::Relaxed);
}

pub fn write_byte(byte: u8) {
    let base = BASE.load(Ordering::Relaxed);
    if base == 0 {
        return;
    }
    #[cfg(target_arch = "arm")]
    unsafe {
        use crate::hal::board::{pl011_regs, PL011_FR_TXFF};
        use crate::hal::memory_barrier;
        let regs = pl011_regs(base);
        memory_barrier();
        while regs.fr.read() & PL011_FR_TXFF != 0 {}
        regs.dr.write(byte as u32);
        memory_barrier();
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = byte;
}

pub fn write_str(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            write_byte(b'\r');
        }
        write_byte(byte);
    }
}

/// `fmt::Write` adapter for the panic path, which must not allocate.
pub struct RawUart;

impl fmt::Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_str(s);
        Ok(())
    }
}
